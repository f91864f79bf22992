//! Yokogawa WT310E-class power meter on the DUT output.
//!
//! The meter is configured for DC input on single-phase two-wire wiring
//! with three numeric items (U, I, P) in ASCII, so one `:NUM:NORM:VAL?`
//! returns the whole `voltage,current,power` triple. Older firmware and
//! some serial adapters garble that combined reply, so the per-channel
//! query (`:NUM:NORM:VAL? 1`, `2`, `3`) is kept as an opt-in fallback.

use std::time::Duration;

use clap::ValueEnum;
use tracing::{debug, warn};

use crate::detect::{EndpointFilter, Probe};
use crate::error::{Error, Result};
use crate::reading::{Measurement, parse_reading};
use crate::transport::{InstrumentHandle, LineConfig, Transport, TransportKind};

const VALUE_QUERY: &str = ":NUM:NORM:VAL?";
const RESET_SETTLE: Duration = Duration::from_secs(1);
/// Processing time the meter needs before the first and between later per-item queries.
const ITEM_LEAD_IN: Duration = Duration::from_millis(400);
const ITEM_GAP: Duration = Duration::from_millis(100);

const SETUP_COMMANDS: &[&str] = &[
    ":INPUT:MODE DC",
    ":INPUT:WIRING P1W2",
    ":INPUT:VOLTAGE:RANGE:AUTO ON",
    ":INPUT:CURRENT:RANGE:AUTO ON",
    ":NUM:ITEM1 U,1",
    ":NUM:ITEM2 I,1",
    ":NUM:ITEM3 P,1",
    ":NUM:NUMB 3",
    ":NUM:FORM ASCII",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum QueryMode {
    /// One query returning all three items.
    #[default]
    Combined,
    /// One query per numeric item.
    PerChannel,
}

/// Bounded retry for meter reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(5, Duration::from_millis(200))
    }
}

pub struct PowerMeter {
    link: Box<dyn Transport>,
    query_mode: QueryMode,
    retry: RetryPolicy,
}

impl PowerMeter {
    /// Detection settings: USBTMC nodes and USB serial bridges at 9600 8N1.
    pub fn probe() -> Probe {
        Probe {
            instrument: "power meter",
            markers: vec!["YOKOGAWA", "WT310"],
            filter: EndpointFilter {
                kinds: vec![TransportKind::Usbtmc, TransportKind::Serial],
                usb_only: true,
            },
            line: LineConfig::new(9600)
                .with_read_timeout(Duration::from_secs(3))
                .with_open_settle(Duration::from_millis(300)),
            port: None,
        }
    }

    pub fn new(link: Box<dyn Transport>) -> Self {
        PowerMeter {
            link,
            query_mode: QueryMode::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_query_mode(mut self, mode: QueryMode) -> Self {
        self.query_mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn handle(&self) -> &InstrumentHandle {
        self.link.handle()
    }

    pub async fn idn(&mut self) -> Result<String> {
        self.query("*IDN?").await
    }

    /// Reset, then select DC input, wiring and the U/I/P numeric items.
    pub async fn setup(&mut self) -> Result<()> {
        self.write("*RST").await?;
        tokio::time::sleep(RESET_SETTLE).await;
        for command in SETUP_COMMANDS {
            self.write(command).await?;
        }
        Ok(())
    }

    /// Read the output-side triple, retrying empty or malformed replies.
    pub async fn read(&mut self) -> Result<Measurement> {
        let attempts = self.retry.attempts;
        let mut last = String::new();

        for attempt in 1..=attempts {
            if let Err(e) = self.link.clear_input().await {
                debug!("meter input clear failed: {e}");
            }
            match self.fetch().await {
                Ok(measurement) => return Ok(measurement),
                Err(e) => {
                    last = format!("attempt {attempt}/{attempts}: {e}");
                    warn!("meter read error, {last}");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff).await;
            }
        }

        Err(Error::ReadExhausted { attempts, last })
    }

    pub async fn close(&mut self) -> Result<()> {
        self.link.close().await?;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Measurement> {
        let raw = match self.query_mode {
            QueryMode::Combined => self.query(VALUE_QUERY).await?,
            QueryMode::PerChannel => {
                let mut fields = Vec::with_capacity(3);
                for item in 1..=3 {
                    tokio::time::sleep(if item == 1 { ITEM_LEAD_IN } else { ITEM_GAP }).await;
                    fields.push(self.query(&format!("{VALUE_QUERY} {item}")).await?);
                }
                fields.join(",")
            }
        };
        parse_reading(&raw)
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        debug!("meter write  -> {command}");
        self.link.write_line(command).await?;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        debug!("meter query  -> {command}");
        let resp = self.link.query(command).await?;
        debug!("meter result <- {resp}");
        Ok(resp)
    }
}
