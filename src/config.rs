use std::path::PathBuf;
use std::time::Duration;

use crate::csv_log::CsvLayout;
use crate::detect::Probe;
use crate::error::{Error, Result};
use crate::meter::{PowerMeter, QueryMode, RetryPolicy};
use crate::schedule::Cadence;
use crate::source::DcSource;

/// Fixed parameters of one charging run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Output voltage at which the run stops.
    pub stop_voltage: f64,
    pub set_voltage: f64,
    pub set_current_limit: f64,
    pub log_interval: Duration,
    /// Wait between enabling the source and the first tick.
    pub stabilizing_delay: Duration,
    pub cadence: Cadence,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            stop_voltage: 8.35,
            set_voltage: 12.0,
            set_current_limit: 2.0,
            log_interval: Duration::from_secs(10),
            stabilizing_delay: Duration::from_millis(500),
            cadence: Cadence::Absolute,
        }
    }
}

/// Longest accepted interval or delay.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        positive("stop voltage", self.stop_voltage)?;
        positive("set voltage", self.set_voltage)?;
        positive("current limit", self.set_current_limit)?;
        if self.log_interval.is_zero() {
            return Err(Error::Config("log interval must be greater than zero".into()));
        }
        bounded("log interval", self.log_interval)?;
        bounded("stabilizing delay", self.stabilizing_delay)
    }
}

fn bounded(name: &str, wait: Duration) -> Result<()> {
    if wait <= MAX_WAIT {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} of {wait:?} exceeds {MAX_WAIT:?}")))
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be a positive number, got {value}")))
    }
}

/// Convert user-supplied seconds, rejecting negative and non-finite values.
pub fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| {
        Error::Config(format!("{name} must be a non-negative number of seconds, got {value} ({e})"))
    })
}

/// Where and how the run's artifacts are written.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub layout: CsvLayout,
    /// Re-render the plot after every tick instead of only at shutdown.
    pub live_plot: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: PathBuf::from("."),
            layout: CsvLayout::Full,
            live_plot: false,
        }
    }
}

/// Everything a bench run needs.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub run: RunConfig,
    pub output: OutputConfig,
    pub meter: Probe,
    pub source: Probe,
    pub query_mode: QueryMode,
    pub retry: RetryPolicy,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            run: RunConfig::default(),
            output: OutputConfig::default(),
            meter: PowerMeter::probe(),
            source: DcSource::probe(),
            query_mode: QueryMode::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_nonsense_run_parameters() {
        let bad = [
            RunConfig {
                stop_voltage: 0.0,
                ..RunConfig::default()
            },
            RunConfig {
                set_current_limit: f64::NAN,
                ..RunConfig::default()
            },
            RunConfig {
                log_interval: Duration::ZERO,
                ..RunConfig::default()
            },
            RunConfig {
                log_interval: MAX_WAIT + Duration::from_secs(1),
                ..RunConfig::default()
            },
            RunConfig {
                stabilizing_delay: Duration::from_secs(u64::MAX),
                ..RunConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn seconds_conversion() {
        assert_eq!(seconds("interval", 0.5).unwrap(), Duration::from_millis(500));
        assert!(seconds("interval", -1.0).is_err());
        assert!(seconds("interval", f64::INFINITY).is_err());
        assert!(seconds("interval", f64::NAN).is_err());
        assert!(matches!(seconds("interval", 1e30), Err(Error::Config(_))));
    }
}
