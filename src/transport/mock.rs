//! Scripted instruments for exercising drivers and the polling loop without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{Connector, Endpoint, InstrumentHandle, LineConfig, Transport};
use crate::error::TransportError;

const MOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Journal {
    writes: Vec<String>,
    closes: u32,
}

/// Shared record of what a [`MockTransport`] was asked to do.
///
/// Clones observe the same journal, so a test can keep one while the
/// transport itself is moved into a driver.
#[derive(Debug, Clone, Default)]
pub struct MockLog(Arc<Mutex<Journal>>);

impl MockLog {
    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn writes(&self) -> Vec<String> {
        self.journal().writes.clone()
    }

    /// Number of times `command` was written.
    pub fn count(&self, command: &str) -> usize {
        self.journal()
            .writes
            .iter()
            .filter(|w| w.as_str() == command)
            .count()
    }

    /// Number of effective closes (closing twice counts once).
    pub fn closes(&self) -> u32 {
        self.journal().closes
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Line(String),
    Silent,
}

/// An instrument that answers commands from a script.
///
/// One-shot replies are consumed first, then the standing reply for the
/// command is used. Commands without a reply time out when read.
#[derive(Debug)]
pub struct MockTransport {
    handle: InstrumentHandle,
    once: HashMap<String, VecDeque<Reply>>,
    standing: HashMap<String, Reply>,
    pending: Option<Reply>,
    latency: Duration,
    log: MockLog,
}

impl MockTransport {
    pub fn new(endpoint: &str) -> Self {
        MockTransport {
            handle: InstrumentHandle::opened(&Endpoint::from_path(endpoint)),
            once: HashMap::new(),
            standing: HashMap::new(),
            pending: None,
            latency: Duration::ZERO,
            log: MockLog::default(),
        }
    }

    /// Answer `command` with `line` every time.
    pub fn reply(mut self, command: &str, line: &str) -> Self {
        self.standing
            .insert(command.to_string(), Reply::Line(line.to_string()));
        self
    }

    /// Answer the next `command` with `line`, ahead of the standing reply.
    pub fn reply_once(mut self, command: &str, line: &str) -> Self {
        self.once
            .entry(command.to_string())
            .or_default()
            .push_back(Reply::Line(line.to_string()));
        self
    }

    /// Let the next `command` go unanswered.
    pub fn silent_once(mut self, command: &str) -> Self {
        self.once
            .entry(command.to_string())
            .or_default()
            .push_back(Reply::Silent);
        self
    }

    /// Delay every read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn log(&self) -> MockLog {
        self.log.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn handle(&self) -> &InstrumentHandle {
        &self.handle
    }

    async fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        if !self.handle.is_open {
            return Err(TransportError::Closed);
        }
        self.log.journal().writes.push(command.to_string());
        self.pending = self
            .once
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.standing.get(command).cloned());
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        if !self.handle.is_open {
            return Err(TransportError::Closed);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.pending.take() {
            Some(Reply::Line(line)) => Ok(line),
            Some(Reply::Silent) | None => Err(TransportError::Timeout(MOCK_TIMEOUT)),
        }
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.pending = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.handle.is_open {
            self.handle.is_open = false;
            self.log.journal().closes += 1;
        }
        Ok(())
    }
}

/// A fixed set of endpoints, each optionally backed by a [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockConnector {
    endpoints: Vec<Endpoint>,
    devices: Mutex<HashMap<String, MockTransport>>,
    opened: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a serial endpoint at `path` served by `device`.
    pub fn with_device(self, path: &str, device: MockTransport) -> Self {
        self.with_endpoint_device(Endpoint::from_path(path), device)
    }

    pub fn with_endpoint_device(mut self, endpoint: Endpoint, mut device: MockTransport) -> Self {
        device.handle = InstrumentHandle::opened(&endpoint);
        self.devices
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(endpoint.id.clone(), device);
        self.endpoints.push(endpoint);
        self
    }

    /// Add an endpoint that is listed but refuses to open.
    pub fn with_dead_endpoint(mut self, path: &str) -> Self {
        self.endpoints.push(Endpoint::from_path(path));
        self
    }

    /// Endpoint ids in the order they were opened.
    pub fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn enumerate(&self) -> Result<Vec<Endpoint>, TransportError> {
        Ok(self.endpoints.clone())
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        _line: &LineConfig,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(endpoint.id.clone());
        let device = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&endpoint.id);
        match device {
            Some(device) => Ok(Box::new(device)),
            None => Err(TransportError::Open {
                endpoint: endpoint.id.clone(),
                reason: format!("no {} device answers", endpoint.kind),
            }),
        }
    }
}
