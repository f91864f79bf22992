//! The charging run: detection, configuration, polling and shutdown.
//!
//! A [`Bench`] owns both drivers and the recorder for the whole run. Every
//! way out of the polling loop goes through [`Bench::shutdown`], which runs
//! at most once.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::pin;

use chrono::Local;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{error, info, warn};

use crate::config::{BenchConfig, OutputConfig, RunConfig};
use crate::detect::detect;
use crate::error::{Error, Result};
use crate::meter::PowerMeter;
use crate::reading::Reading;
use crate::schedule::TickSchedule;
use crate::session::{Recorder, RunSession};
use crate::source::DcSource;
use crate::transport::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detecting,
    Configuring,
    Running,
    Stopping,
    Closed,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Detecting => "detecting",
            Phase::Configuring => "configuring",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Closed => "closed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why the polling loop ended.
#[derive(Debug)]
pub enum StopReason {
    Threshold { voltage: f64 },
    Interrupted,
    Failed(Error),
}

#[derive(Debug)]
pub enum RunOutcome {
    /// One of the instruments is not connected; nothing was configured.
    NotDetected { instrument: String },
    ThresholdReached { voltage: f64 },
    Interrupted,
    Failed(Error),
}

impl From<StopReason> for RunOutcome {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Threshold { voltage } => RunOutcome::ThresholdReached { voltage },
            StopReason::Interrupted => RunOutcome::Interrupted,
            StopReason::Failed(e) => RunOutcome::Failed(e),
        }
    }
}

/// What the shutdown sequence did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// One entry per failed step, in sequence order.
    pub failures: Vec<Error>,
    pub csv_path: Option<PathBuf>,
    /// Set only when the plot was rendered.
    pub plot_path: Option<PathBuf>,
    pub samples: u64,
}

#[derive(Debug)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// `None` when the run never got past detection.
    pub shutdown: Option<ShutdownReport>,
}

impl RunSummary {
    fn before_configuring(outcome: RunOutcome) -> Self {
        RunSummary {
            outcome,
            shutdown: None,
        }
    }
}

pub struct Bench {
    meter: PowerMeter,
    source: DcSource,
    run: RunConfig,
    output: OutputConfig,
    recorder: Option<Recorder>,
    phase: Phase,
}

impl Bench {
    /// Take ownership of two detected instruments.
    pub fn new(meter: PowerMeter, source: DcSource, run: RunConfig, output: OutputConfig) -> Self {
        let mut bench = Bench {
            meter,
            source,
            run,
            output,
            recorder: None,
            phase: Phase::Detecting,
        };
        bench.enter(Phase::Configuring);
        bench
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&RunSession> {
        self.recorder.as_ref().map(Recorder::session)
    }

    fn enter(&mut self, phase: Phase) {
        info!("phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Configure the instruments and poll until a stop condition.
    ///
    /// Does not shut down; call [`shutdown`](Self::shutdown) afterwards.
    pub async fn run_until_stopped<I>(&mut self, interrupt: &mut I) -> StopReason
    where
        I: Future<Output = ()> + Unpin,
    {
        let configured = tokio::select! {
            biased;
            _ = &mut *interrupt => return StopReason::Interrupted,
            result = self.configure() => result,
        };
        if let Err(e) = configured {
            error!("configuration failed: {e}");
            return StopReason::Failed(e);
        }

        self.enter(Phase::Running);
        let mut schedule = TickSchedule::new(self.run.cadence, self.run.log_interval, Instant::now());
        loop {
            let reading = match self.tick().await {
                Ok(reading) => reading,
                Err(e) => {
                    error!("run aborted: {e}");
                    return StopReason::Failed(e);
                }
            };

            if reading.output_voltage >= self.run.stop_voltage {
                info!(
                    "stop voltage reached: {:.3} V >= {:.3} V",
                    reading.output_voltage, self.run.stop_voltage
                );
                return StopReason::Threshold {
                    voltage: reading.output_voltage,
                };
            }

            let skipped = schedule.skipped();
            let deadline = schedule.next_deadline(Instant::now());
            if schedule.skipped() > skipped {
                warn!(
                    "tick overran the interval, skipped {} slot(s)",
                    schedule.skipped() - skipped
                );
            }

            tokio::select! {
                biased;
                _ = &mut *interrupt => {
                    info!("interrupted by user");
                    return StopReason::Interrupted;
                }
                _ = sleep_until(deadline) => {}
            }
        }
    }

    async fn configure(&mut self) -> Result<()> {
        self.recorder = Some(Recorder::start(&self.output)?);

        info!("configuring power meter on {}", self.meter.handle().endpoint);
        self.meter.setup().await?;

        info!(
            "enabling DC output: {:.2} V, {:.2} A limit",
            self.run.set_voltage, self.run.set_current_limit
        );
        self.source
            .enable(self.run.set_voltage, self.run.set_current_limit)
            .await?;
        sleep(self.run.stabilizing_delay).await;
        Ok(())
    }

    async fn tick(&mut self) -> Result<Reading> {
        let output = self.meter.read().await?;
        let input = self.source.measure().await?;
        let reading = Reading::new(Local::now(), input, output);

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&reading)?;
        }

        info!(
            "{} | In: {:.3} V {:.3} A {:.3} W | Out: {:.3} V {:.3} A {:.3} W",
            reading.timestamp_label(),
            reading.input_voltage,
            reading.input_current,
            reading.input_power,
            reading.output_voltage,
            reading.output_current,
            reading.output_power,
        );
        Ok(reading)
    }

    /// Disable the output, release both instruments and finalise the artifacts.
    ///
    /// Every step runs even if an earlier one failed. Returns `None` once the
    /// bench is already closed.
    pub async fn shutdown(&mut self) -> Option<ShutdownReport> {
        if self.phase == Phase::Closed {
            return None;
        }
        self.enter(Phase::Stopping);

        let mut report = ShutdownReport::default();
        let mut guard = |step: &'static str, result: Result<()>| {
            if let Err(e) = result {
                warn!("shutdown step `{step}` failed: {e}");
                report.failures.push(Error::cleanup(step, e));
            }
        };

        guard("disable output", self.source.disable().await);
        guard("close meter", self.meter.close().await);
        guard("close source", self.source.close().await);

        if let Some(recorder) = self.recorder.as_mut() {
            guard("flush csv", recorder.flush());
            let rendered = recorder.render_plot();
            let plotted = rendered.is_ok();
            guard("render plot", rendered);

            let session = recorder.session();
            report.csv_path = Some(session.csv_path.clone());
            report.plot_path = plotted.then(|| session.plot_path.clone());
            report.samples = session.sample_count;
        }

        self.enter(Phase::Closed);
        match &report.csv_path {
            Some(path) => info!("CSV saved: {} ({} samples)", path.display(), report.samples),
            None => info!("no CSV log was started"),
        }
        if let Some(path) = &report.plot_path {
            info!("plot saved: {}", path.display());
        }
        Some(report)
    }
}

/// Detect both instruments, run until a stop condition, then shut down.
///
/// `interrupt` completing at any point stops the run; once the source may
/// have been enabled the shutdown sequence still runs.
pub async fn run<C, F>(connector: &C, config: &BenchConfig, interrupt: F) -> RunSummary
where
    C: Connector + ?Sized,
    F: Future<Output = ()>,
{
    let mut interrupt = pin!(interrupt);

    info!("phase: {}", Phase::Detecting);
    let (meter, source) = match detect_pair(connector, config, &mut interrupt).await {
        Ok(pair) => pair,
        Err(outcome) => return RunSummary::before_configuring(outcome),
    };

    let mut bench = Bench::new(meter, source, config.run.clone(), config.output.clone());
    let reason = bench.run_until_stopped(&mut interrupt).await;
    let shutdown = bench.shutdown().await;
    RunSummary {
        outcome: reason.into(),
        shutdown,
    }
}

/// Meter first, then the source on any endpoint the meter did not claim.
///
/// Whatever was opened is closed again unless both instruments are found.
async fn detect_pair<C, I>(
    connector: &C,
    config: &BenchConfig,
    interrupt: &mut I,
) -> Result<(PowerMeter, DcSource), RunOutcome>
where
    C: Connector + ?Sized,
    I: Future<Output = ()> + Unpin,
{
    let found = tokio::select! {
        biased;
        _ = &mut *interrupt => {
            info!("interrupted during detection");
            return Err(RunOutcome::Interrupted);
        }
        found = detect(connector, &config.meter, &[]) => found,
    };
    let Some(meter) = found else {
        let instrument = config.meter.instrument.to_string();
        warn!("{instrument} not detected, nothing to do");
        return Err(RunOutcome::NotDetected { instrument });
    };
    let claimed = [meter.link.handle().endpoint.clone()];
    let mut meter = PowerMeter::new(meter.link)
        .with_query_mode(config.query_mode)
        .with_retry(config.retry);

    let found = tokio::select! {
        biased;
        _ = &mut *interrupt => None,
        found = detect(connector, &config.source, &claimed) => Some(found),
    };
    let outcome = match found {
        Some(Some(source)) => return Ok((meter, DcSource::new(source.link))),
        Some(None) => {
            let instrument = config.source.instrument.to_string();
            warn!("{instrument} not detected, nothing to do");
            RunOutcome::NotDetected { instrument }
        }
        None => {
            info!("interrupted during detection");
            RunOutcome::Interrupted
        }
    };
    if let Err(e) = meter.close().await {
        warn!("closing power meter failed: {e}");
    }
    Err(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn bench(meter: MockTransport, source: MockTransport, dir: &std::path::Path) -> Bench {
        let output = OutputConfig {
            dir: dir.to_path_buf(),
            ..OutputConfig::default()
        };
        Bench::new(
            PowerMeter::new(Box::new(meter)),
            DcSource::new(Box::new(source)),
            RunConfig::default(),
            output,
        )
    }

    #[test]
    fn phases_have_readable_labels() {
        assert_eq!(Phase::Running.to_string(), "running");
        assert_eq!(Phase::Closed.label(), "closed");
    }

    #[tokio::test]
    async fn shutdown_before_configuring_still_releases_instruments() {
        let dir = tempfile::tempdir().unwrap();
        let meter = MockTransport::new("/dev/ttyUSB0");
        let source = MockTransport::new("/dev/ttyUSB1");
        let (meter_log, source_log) = (meter.log(), source.log());

        let mut bench = bench(meter, source, dir.path());
        let report = bench.shutdown().await.unwrap();

        assert!(report.failures.is_empty());
        assert_eq!(report.csv_path, None);
        assert_eq!(source_log.writes(), ["OUTP OFF"]);
        assert_eq!(meter_log.closes(), 1);
        assert_eq!(source_log.closes(), 1);
        assert_eq!(bench.phase(), Phase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_before_configuring_skips_instrument_setup() {
        let dir = tempfile::tempdir().unwrap();
        let meter = MockTransport::new("/dev/ttyUSB0");
        let meter_log = meter.log();
        let mut bench = bench(meter, MockTransport::new("/dev/ttyUSB1"), dir.path());

        let reason = bench.run_until_stopped(&mut std::future::ready(())).await;

        assert!(matches!(reason, StopReason::Interrupted));
        assert!(meter_log.writes().is_empty());
    }

    #[tokio::test]
    async fn failed_cleanup_steps_do_not_stop_later_ones() {
        let dir = tempfile::tempdir().unwrap();
        let meter = MockTransport::new("/dev/ttyUSB0");
        let mut source = MockTransport::new("/dev/ttyUSB1");
        let source_log = source.log();
        // A closed source rejects the disable command.
        crate::transport::Transport::close(&mut source).await.unwrap();
        let meter_log = meter.log();

        let mut bench = bench(meter, source, dir.path());
        let report = bench.shutdown().await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            Error::Cleanup { step: "disable output", .. }
        ));
        assert_eq!(meter_log.closes(), 1);
        assert_eq!(source_log.closes(), 1);
    }
}
