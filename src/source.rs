use std::time::Duration;

use tracing::debug;

use crate::detect::{EndpointFilter, Probe};
use crate::error::{Error, Result};
use crate::reading::Measurement;
use crate::transport::{InstrumentHandle, LineConfig, Transport, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    On,
    Off,
}

impl OutputState {
    fn as_str(self) -> &'static str {
        match self {
            OutputState::On => "ON",
            OutputState::Off => "OFF",
        }
    }
}

/// Programmable DC source (SPE6103 and compatibles) feeding the DUT.
pub struct DcSource {
    link: Box<dyn Transport>,
}

impl DcSource {
    /// Detection settings: any serial port, 115200 8N1, `\r\n` both ways.
    pub fn probe() -> Probe {
        Probe {
            instrument: "DC source",
            markers: vec!["SPE", "6103"],
            filter: EndpointFilter {
                kinds: vec![TransportKind::Serial],
                usb_only: false,
            },
            line: LineConfig::new(115_200).with_read_timeout(Duration::from_secs(2)),
            port: None,
        }
    }

    pub fn new(link: Box<dyn Transport>) -> Self {
        Self { link }
    }

    pub fn handle(&self) -> &InstrumentHandle {
        self.link.handle()
    }

    pub async fn idn(&mut self) -> Result<String> {
        self.query("*IDN?").await
    }

    /// Program the setpoint and current limit, then switch the output on.
    ///
    /// The instrument does not acknowledge these commands.
    pub async fn enable(&mut self, volts: f64, current_limit: f64) -> Result<()> {
        self.set_voltage(volts).await?;
        self.set_current(current_limit).await?;
        self.set_output(OutputState::On).await
    }

    pub async fn disable(&mut self) -> Result<()> {
        self.set_output(OutputState::Off).await
    }

    pub async fn set_voltage(&mut self, volts: f64) -> Result<()> {
        ensure_setpoint("voltage", volts)?;
        self.write(&format!("VOLT {volts:.2}")).await
    }

    pub async fn set_current(&mut self, amps: f64) -> Result<()> {
        ensure_setpoint("current", amps)?;
        self.write(&format!("CURR {amps:.2}")).await
    }

    pub async fn set_output(&mut self, state: OutputState) -> Result<()> {
        self.write(&format!("OUTP {}", state.as_str())).await
    }

    pub async fn measure_voltage(&mut self) -> Result<f64> {
        let resp = self.query("MEAS:VOLT?").await?;
        parse_f64(&resp)
    }

    pub async fn measure_current(&mut self) -> Result<f64> {
        let resp = self.query("MEAS:CURR?").await?;
        parse_f64(&resp)
    }

    pub async fn measure_power(&mut self) -> Result<f64> {
        let resp = self.query("MEAS:POW?").await?;
        parse_f64(&resp)
    }

    /// Three independent queries; the source has no combined readout.
    pub async fn measure(&mut self) -> Result<Measurement> {
        Ok(Measurement {
            voltage: self.measure_voltage().await?,
            current: self.measure_current().await?,
            power: self.measure_power().await?,
        })
    }

    pub async fn close(&mut self) -> Result<()> {
        self.link.close().await?;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        debug!("SCPI write  -> {command}");
        self.link.write_line(command).await?;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        debug!("SCPI query  -> {command}");
        let resp = self.link.query(command).await?;
        debug!("SCPI result <- {resp}");

        if resp.is_empty() {
            return Err(Error::ReadParse {
                raw: resp,
                reason: format!("empty response to {command:?}"),
            });
        }
        Ok(resp)
    }
}

fn ensure_setpoint(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} setpoint must be a non-negative number, got {value}")))
    }
}

fn parse_f64(input: &str) -> Result<f64> {
    input.trim().parse::<f64>().map_err(|e| Error::ReadParse {
        raw: input.to_string(),
        reason: format!("failed to parse float: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn source(mock: MockTransport) -> DcSource {
        DcSource::new(Box::new(mock))
    }

    #[tokio::test]
    async fn enable_writes_setpoints_then_output() {
        let mock = MockTransport::new("/dev/ttyUSB1");
        let log = mock.log();
        let mut dc = source(mock);

        dc.enable(12.0, 2.0).await.unwrap();

        assert_eq!(log.writes(), vec!["VOLT 12.00", "CURR 2.00", "OUTP ON"]);
    }

    #[tokio::test]
    async fn rejects_negative_setpoint_without_writing() {
        let mock = MockTransport::new("/dev/ttyUSB1");
        let log = mock.log();
        let mut dc = source(mock);

        assert!(matches!(dc.enable(-1.0, 2.0).await, Err(Error::Config(_))));
        assert!(log.writes().is_empty());
    }

    #[tokio::test]
    async fn measure_issues_three_queries() {
        let mock = MockTransport::new("/dev/ttyUSB1")
            .reply("MEAS:VOLT?", "12.01")
            .reply("MEAS:CURR?", "2.00")
            .reply("MEAS:POW?", "24.02");
        let log = mock.log();
        let mut dc = source(mock);

        let m = dc.measure().await.unwrap();

        assert_eq!(m, Measurement::new(12.01, 2.0, 24.02));
        assert_eq!(log.writes(), vec!["MEAS:VOLT?", "MEAS:CURR?", "MEAS:POW?"]);
    }

    #[tokio::test]
    async fn empty_or_garbled_reply_is_a_parse_error() {
        let mock = MockTransport::new("/dev/ttyUSB1")
            .reply_once("MEAS:VOLT?", "")
            .reply("MEAS:VOLT?", "12.0V");
        let mut dc = source(mock);

        assert!(matches!(dc.measure_voltage().await, Err(Error::ReadParse { .. })));
        assert!(matches!(dc.measure_voltage().await, Err(Error::ReadParse { .. })));
    }

    #[tokio::test]
    async fn disable_after_close_fails_but_close_stays_idempotent() {
        let mock = MockTransport::new("/dev/ttyUSB1");
        let log = mock.log();
        let mut dc = source(mock);

        dc.close().await.unwrap();
        dc.close().await.unwrap();
        assert!(dc.disable().await.is_err());
        assert_eq!(log.closes(), 1);
        assert!(!dc.handle().is_open);
    }

    #[test]
    fn probe_matches_spe_identification() {
        let probe = DcSource::probe();
        assert!(probe.matches("OWON,SPE6103,2311,FV:V1.3.0"));
        assert!(!probe.matches("YOKOGAWA,WT310E,C2LA,F1.03"));
        assert_eq!(probe.line.baud_rate, 115_200);
    }
}
