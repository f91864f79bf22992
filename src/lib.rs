pub mod bench;
pub mod config;
pub mod csv_log;
pub mod detect;
pub mod error;
pub mod meter;
pub mod plot;
pub mod reading;
pub mod schedule;
pub mod session;
pub mod source;
pub mod transport;

// Re-export the primary types so users can drive a bench run
// without knowing the internal module layout.
pub use bench::{Bench, Phase, RunOutcome, RunSummary, ShutdownReport, StopReason, run};
pub use config::{BenchConfig, OutputConfig, RunConfig};
pub use csv_log::{CsvLayout, CsvLog};
pub use detect::{Detected, Probe, detect};
pub use error::{Error, Result, TransportError};
pub use meter::{PowerMeter, QueryMode, RetryPolicy};
pub use plot::{PlotPoint, PlotSeries};
pub use reading::{Measurement, Reading, parse_reading};
pub use schedule::{Cadence, TickSchedule};
pub use session::{Recorder, RunSession};
pub use source::{DcSource, OutputState};
pub use transport::{Connector, Endpoint, LineConfig, SystemConnector, Transport, TransportKind};
