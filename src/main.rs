use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use charge_bench::config::seconds;
use charge_bench::plot::artifact_path;
use charge_bench::{
    BenchConfig, Cadence, Connector, CsvLayout, DcSource, OutputConfig, PlotSeries, PowerMeter,
    Probe, QueryMode, RetryPolicy, RunConfig, RunOutcome, SystemConnector, detect,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "charge-bench", version, about = "Battery/UPS charging bench automation")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Charge until the output reaches the stop voltage, logging every tick.
    Run(RunArgs),
    /// List candidate endpoints.
    List,
    /// Detect both instruments and print their identification.
    Identify(PortArgs),
    /// Render the plot for an existing CSV log.
    Plot { csv: PathBuf },
}

#[derive(Args)]
struct PortArgs {
    /// Skip detection for the meter and use this port.
    #[arg(long)]
    meter_port: Option<String>,
    /// Skip detection for the source and use this port.
    #[arg(long)]
    source_port: Option<String>,
    #[arg(long, default_value_t = 9600)]
    meter_baud: u32,
    #[arg(long, default_value_t = 115_200)]
    source_baud: u32,
}

impl PortArgs {
    fn probes(&self) -> (Probe, Probe) {
        let meter = PowerMeter::probe()
            .with_port(self.meter_port.clone())
            .with_baud_rate(self.meter_baud);
        let source = DcSource::probe()
            .with_port(self.source_port.clone())
            .with_baud_rate(self.source_baud);
        (meter, source)
    }
}

#[derive(Args)]
struct RunArgs {
    /// Output voltage (V) that ends the run.
    #[arg(long, default_value_t = 8.35)]
    stop_voltage: f64,
    /// DC source setpoint (V).
    #[arg(long, default_value_t = 12.0)]
    set_voltage: f64,
    /// DC source current limit (A).
    #[arg(long, default_value_t = 2.0)]
    set_current: f64,
    /// Seconds between ticks.
    #[arg(long, default_value_t = 10.0)]
    interval: f64,
    /// Seconds to wait after enabling the output.
    #[arg(long, default_value_t = 0.5)]
    stabilize: f64,
    #[arg(long, value_enum, default_value_t = Cadence::Absolute)]
    cadence: Cadence,
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = CsvLayout::Full)]
    csv_layout: CsvLayout,
    /// Re-render the plot after every tick.
    #[arg(long)]
    live_plot: bool,
    #[arg(long, value_enum, default_value_t = QueryMode::Combined)]
    meter_query: QueryMode,
    #[command(flatten)]
    ports: PortArgs,
}

impl RunArgs {
    fn bench_config(&self) -> Result<BenchConfig> {
        let run = RunConfig {
            stop_voltage: self.stop_voltage,
            set_voltage: self.set_voltage,
            set_current_limit: self.set_current,
            log_interval: seconds("interval", self.interval)?,
            stabilizing_delay: seconds("stabilizing delay", self.stabilize)?,
            cadence: self.cadence,
        };
        run.validate().context("invalid run parameters")?;

        let (meter, source) = self.ports.probes();
        Ok(BenchConfig {
            run,
            output: OutputConfig {
                dir: self.output_dir.clone(),
                layout: self.csv_layout,
                live_plot: self.live_plot,
            },
            meter,
            source,
            query_mode: self.meter_query,
            retry: RetryPolicy::default(),
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Run(args) => run(&args).await,
        Command::List => list(),
        Command::Identify(ports) => identify(&ports).await,
        Command::Plot { csv } => plot(&csv),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Completes on the first Ctrl-C. Never completes if the handler cannot be installed.
fn interrupt() -> impl Future<Output = ()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => warn!("cannot listen for Ctrl-C: {e}"),
        }
    });
    async move {
        if rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run(args: &RunArgs) -> Result<ExitCode> {
    let config = args.bench_config()?;
    let summary = charge_bench::run(&SystemConnector, &config, interrupt()).await;

    if let Some(report) = &summary.shutdown {
        if !report.failures.is_empty() {
            warn!("{} shutdown step(s) failed", report.failures.len());
        }
    }

    let code = match summary.outcome {
        RunOutcome::NotDetected { instrument } => {
            println!("{instrument} not detected, check the connection and power");
            ExitCode::SUCCESS
        }
        RunOutcome::ThresholdReached { voltage } => {
            println!("Charging complete at {voltage:.3} V");
            ExitCode::SUCCESS
        }
        RunOutcome::Interrupted => {
            println!("Run interrupted");
            ExitCode::SUCCESS
        }
        RunOutcome::Failed(e) => {
            eprintln!("Run failed: {e}");
            ExitCode::FAILURE
        }
    };
    Ok(code)
}

fn list() -> Result<ExitCode> {
    let endpoints = SystemConnector
        .enumerate()
        .context("enumerating endpoints")?;
    if endpoints.is_empty() {
        println!("No candidate endpoints found.");
    }
    for endpoint in endpoints {
        println!(
            "{:<24} {:<7} {}",
            endpoint.id,
            endpoint.kind.label(),
            if endpoint.usb { "usb" } else { "" }
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn identify(ports: &PortArgs) -> Result<ExitCode> {
    let (meter, source) = ports.probes();
    let mut claimed: Vec<String> = Vec::new();

    for probe in [&meter, &source] {
        match detect(&SystemConnector, probe, &claimed).await {
            Some(mut found) => {
                let endpoint = found.link.handle().endpoint.clone();
                println!("{:<12} {endpoint}: {}", probe.instrument, found.idn);
                found
                    .link
                    .close()
                    .await
                    .with_context(|| format!("closing {endpoint}"))?;
                claimed.push(endpoint);
            }
            None => println!("{:<12} not detected", probe.instrument),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn plot(csv: &Path) -> Result<ExitCode> {
    let series =
        PlotSeries::from_csv(csv).with_context(|| format!("reading {}", csv.display()))?;
    let out = artifact_path(csv);
    series
        .render(&out)
        .with_context(|| format!("rendering {}", out.display()))?;
    println!("Plot saved: {} ({} points)", out.display(), series.len());
    Ok(ExitCode::SUCCESS)
}
