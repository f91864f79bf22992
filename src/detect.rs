//! Instrument auto-detection.
//!
//! Candidates are probed one at a time with `*IDN?`; the first reply that
//! contains one of the probe's markers wins and the remaining endpoints are
//! left untouched. A candidate that cannot be opened or does not answer is
//! logged and skipped, and every non-matching candidate is closed again, so
//! an unsuccessful detection leaves nothing open.

use tracing::{debug, info, warn};

use crate::transport::{Connector, Endpoint, LineConfig, Transport, TransportKind};

pub const IDN_QUERY: &str = "*IDN?";

/// Naming convention for endpoints an instrument may live on.
#[derive(Debug, Clone)]
pub struct EndpointFilter {
    pub kinds: Vec<TransportKind>,
    pub usb_only: bool,
}

impl EndpointFilter {
    pub fn accepts(&self, endpoint: &Endpoint) -> bool {
        self.kinds.contains(&endpoint.kind) && (endpoint.usb || !self.usb_only)
    }
}

/// How to find one kind of instrument.
#[derive(Debug, Clone)]
pub struct Probe {
    pub instrument: &'static str,
    /// Substrings of the `*IDN?` reply, any of which identifies the instrument.
    pub markers: Vec<&'static str>,
    pub filter: EndpointFilter,
    pub line: LineConfig,
    /// Probe only this endpoint instead of enumerating.
    pub port: Option<String>,
}

impl Probe {
    pub fn with_port(mut self, port: Option<String>) -> Self {
        self.port = port;
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.line.baud_rate = baud_rate;
        self
    }

    pub fn matches(&self, idn: &str) -> bool {
        self.markers.iter().any(|marker| idn.contains(marker))
    }

    fn candidates<C: Connector + ?Sized>(&self, connector: &C, exclude: &[String]) -> Vec<Endpoint> {
        if let Some(port) = &self.port {
            return vec![Endpoint::from_path(port)];
        }
        let endpoints = match connector.enumerate() {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("{}: endpoint enumeration failed: {e}", self.instrument);
                return Vec::new();
            }
        };
        endpoints
            .into_iter()
            .filter(|endpoint| self.filter.accepts(endpoint))
            .filter(|endpoint| !exclude.contains(&endpoint.id))
            .collect()
    }
}

/// A transport that identified as the requested instrument.
pub struct Detected {
    pub link: Box<dyn Transport>,
    pub idn: String,
}

/// Find the first endpoint whose `*IDN?` reply matches `probe`.
///
/// Endpoints listed in `exclude` are never opened. `None` is the ordinary
/// "not connected" outcome.
pub async fn detect<C: Connector + ?Sized>(
    connector: &C,
    probe: &Probe,
    exclude: &[String],
) -> Option<Detected> {
    let candidates = probe.candidates(connector, exclude);
    debug!("{}: {} candidate endpoint(s)", probe.instrument, candidates.len());

    for endpoint in candidates {
        let mut link = match connector.open(&endpoint, &probe.line).await {
            Ok(link) => link,
            Err(e) => {
                warn!("{}: skipping {endpoint}: {e}", probe.instrument);
                continue;
            }
        };

        match link.query(IDN_QUERY).await {
            Ok(idn) if probe.matches(&idn) => {
                info!("{} detected on {endpoint}: {idn}", probe.instrument);
                return Some(Detected { link, idn });
            }
            Ok(idn) => debug!("{}: {endpoint} identifies as {idn:?}", probe.instrument),
            Err(e) => warn!("{}: no identification from {endpoint}: {e}", probe.instrument),
        }

        if let Err(e) = link.close().await {
            warn!("{}: closing {endpoint} failed: {e}", probe.instrument);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockTransport};

    fn probe() -> Probe {
        Probe {
            instrument: "power meter",
            markers: vec!["YOKOGAWA", "WT310"],
            filter: EndpointFilter {
                kinds: vec![TransportKind::Serial, TransportKind::Usbtmc],
                usb_only: true,
            },
            line: LineConfig::new(9600),
            port: None,
        }
    }

    fn answering(idn: &str) -> MockTransport {
        MockTransport::new("unused").reply(IDN_QUERY, idn)
    }

    #[tokio::test]
    async fn first_match_wins_and_short_circuits() {
        let other = answering("OWON,SPE6103,2302,V1.2");
        let other_log = other.log();
        let connector = MockConnector::new()
            .with_device("/dev/ttyUSB0", other)
            .with_device("/dev/ttyUSB1", answering("YOKOGAWA,WT310E,C2LA,F1.03"))
            .with_device("/dev/ttyUSB2", answering("YOKOGAWA,WT310E,C2LB,F1.03"));

        let found = detect(&connector, &probe(), &[]).await.unwrap();

        assert_eq!(found.link.handle().endpoint, "/dev/ttyUSB1");
        assert!(found.idn.starts_with("YOKOGAWA"));
        assert_eq!(connector.opened(), vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        assert_eq!(other_log.closes(), 1);
    }

    #[tokio::test]
    async fn marker_match_is_case_sensitive() {
        let connector =
            MockConnector::new().with_device("/dev/ttyUSB0", answering("yokogawa,wt310e"));
        assert!(detect(&connector, &probe(), &[]).await.is_none());
    }

    #[tokio::test]
    async fn bad_endpoints_do_not_abort_detection() {
        let mute = MockTransport::new("unused").silent_once(IDN_QUERY);
        let mute_log = mute.log();
        let connector = MockConnector::new()
            .with_dead_endpoint("/dev/ttyUSB0")
            .with_device("/dev/ttyUSB1", mute)
            .with_device("/dev/usbtmc0", answering("YOKOGAWA,WT310E"));

        let found = detect(&connector, &probe(), &[]).await.unwrap();

        assert_eq!(found.link.handle().kind, TransportKind::Usbtmc);
        assert_eq!(mute_log.closes(), 1);
    }

    #[tokio::test]
    async fn not_found_leaves_nothing_open() {
        let a = answering("OWON,SPE6103");
        let b = answering("RIGOL,DP832");
        let (a_log, b_log) = (a.log(), b.log());
        let connector = MockConnector::new()
            .with_device("/dev/ttyUSB0", a)
            .with_device("/dev/ttyACM0", b);

        assert!(detect(&connector, &probe(), &[]).await.is_none());
        assert_eq!(a_log.closes(), 1);
        assert_eq!(b_log.closes(), 1);
    }

    #[tokio::test]
    async fn filter_and_exclusions_limit_candidates() {
        let connector = MockConnector::new()
            .with_device("/dev/ttyS0", answering("YOKOGAWA,WT310E"))
            .with_device("/dev/ttyUSB0", answering("YOKOGAWA,WT310E"));

        let excluded = vec!["/dev/ttyUSB0".to_string()];
        assert!(detect(&connector, &probe(), &excluded).await.is_none());
        // ttyS0 is not a USB-class port, so it was never opened.
        assert!(connector.opened().is_empty());
    }

    #[tokio::test]
    async fn explicit_port_skips_enumeration() {
        let connector = MockConnector::new()
            .with_device("/dev/ttyUSB0", answering("YOKOGAWA,WT310E"))
            .with_device("/dev/ttyUSB7", answering("YOKOGAWA,WT310E"));

        let probe = probe().with_port(Some("/dev/ttyUSB7".to_string()));
        let found = detect(&connector, &probe, &[]).await.unwrap();

        assert_eq!(found.link.handle().endpoint, "/dev/ttyUSB7");
        assert_eq!(connector.opened(), vec!["/dev/ttyUSB7"]);
    }
}
