use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::time::Instant;
use tracing::warn;

use crate::config::OutputConfig;
use crate::csv_log::CsvLog;
use crate::error::{Error, Result};
use crate::plot::{PlotPoint, PlotSeries, artifact_path};
use crate::reading::Reading;

/// Bookkeeping for one run's artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSession {
    pub start_time: DateTime<Local>,
    pub csv_path: PathBuf,
    pub plot_path: PathBuf,
    pub sample_count: u64,
}

impl RunSession {
    /// `charging_log_<YYYYmmdd_HHMMSS>.csv` in `dir`, with the plot alongside.
    pub fn new(dir: &Path, start_time: DateTime<Local>) -> Self {
        let csv_path = dir.join(format!(
            "charging_log_{}.csv",
            start_time.format("%Y%m%d_%H%M%S")
        ));
        RunSession {
            start_time,
            plot_path: artifact_path(&csv_path),
            csv_path,
            sample_count: 0,
        }
    }
}

/// Owns both sinks and feeds them one reading per tick.
pub struct Recorder {
    session: RunSession,
    /// Elapsed time on the plot counts from the first recorded tick.
    started: Option<Instant>,
    csv: CsvLog,
    plot: PlotSeries,
    live_plot: bool,
}

impl Recorder {
    pub fn start(output: &OutputConfig) -> Result<Self> {
        std::fs::create_dir_all(&output.dir).map_err(|e| Error::Csv(e.into()))?;
        let session = RunSession::new(&output.dir, Local::now());
        let csv = CsvLog::create(&session.csv_path, output.layout)?;
        Ok(Recorder {
            session,
            started: None,
            csv,
            plot: PlotSeries::new(),
            live_plot: output.live_plot,
        })
    }

    pub fn record(&mut self, reading: &Reading) -> Result<()> {
        self.csv.append(reading)?;
        let started = *self.started.get_or_insert_with(Instant::now);
        self.plot.push(PlotPoint {
            elapsed_s: started.elapsed().as_secs_f64(),
            voltage: reading.output_voltage,
            current: reading.output_current,
        });
        self.session.sample_count += 1;

        if self.live_plot {
            if let Err(e) = self.plot.render(&self.session.plot_path) {
                warn!("live plot update failed: {e}");
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.csv.flush()
    }

    pub fn render_plot(&self) -> Result<()> {
        self.plot.render(&self.session.plot_path)
    }

    pub fn session(&self) -> &RunSession {
        &self.session
    }

    pub fn series(&self) -> &PlotSeries {
        &self.plot
    }
}
