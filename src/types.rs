use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::ScanError;
use crate::ports::COMMON_PORTS;

/// Transport protocol used when probing a port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ScanError::InvalidRequest(format!(
                "unsupported protocol: {other}"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Open,
    Invalid,
}

/// One reported port. Closed or unreachable ports never produce one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: String,
    pub product: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PortResult {
    pub fn open(port: u16, protocol: Protocol, service: String, product: String) -> Self {
        Self {
            port,
            protocol,
            state: PortState::Open,
            service,
            product,
            error: None,
        }
    }

    pub fn invalid(port: u16, protocol: Protocol, service: String, error: String) -> Self {
        Self {
            port,
            protocol,
            state: PortState::Invalid,
            service,
            product: String::new(),
            error: Some(error),
        }
    }
}

/// A validated scan request. Construction enforces `1 <= start <= end <= 65535`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    target: String,
    start_port: u16,
    end_port: u16,
    protocol: Protocol,
}

impl ScanRequest {
    pub fn new(
        target: impl Into<String>,
        start_port: u32,
        end_port: u32,
        protocol: Protocol,
    ) -> Result<Self, ScanError> {
        let target = target.into();
        if target.trim().is_empty() {
            return Err(ScanError::InvalidRequest("target is empty".into()));
        }
        for p in [start_port, end_port] {
            if p == 0 || p > 65535 {
                return Err(ScanError::InvalidRequest(format!(
                    "port out of range: {p}"
                )));
            }
        }
        if start_port > end_port {
            return Err(ScanError::InvalidRequest(format!(
                "invalid range {start_port}-{end_port} (start > end)"
            )));
        }
        Ok(Self {
            target,
            start_port: start_port as u16,
            end_port: end_port as u16,
            protocol,
        })
    }

    /// Request covering the inclusive span between the lowest and highest
    /// well-known port, including every port in between.
    pub fn common(target: impl Into<String>, protocol: Protocol) -> Result<Self, ScanError> {
        let (min, max) = common_port_bounds();
        Self::new(target, min as u32, max as u32, protocol)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    pub fn end_port(&self) -> u16 {
        self.end_port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn ports(&self) -> std::ops::RangeInclusive<u16> {
        self.start_port..=self.end_port
    }

    pub fn total_ports(&self) -> u64 {
        u64::from(self.end_port - self.start_port) + 1
    }
}

fn common_port_bounds() -> (u16, u16) {
    let min = COMMON_PORTS.iter().copied().min().unwrap_or(1);
    let max = COMMON_PORTS.iter().copied().max().unwrap_or(65535);
    (min, max)
}

/// Incremental status emitted once per completed probe.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanProgress {
    pub progress: f64,
    pub open_ports: Vec<PortResult>,
    pub os_info: String,
}

/// Final report of a session that got past resolution.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub progress: u8,
    pub open_ports: Vec<PortResult>,
    pub target: String,
    pub target_hostname: String,
    pub total_open_ports: usize,
    pub start_time: String,
    pub end_time: String,
    pub duration: String,
    pub os_info: String,
    pub scan_type: Protocol,
    pub actual_target: String,
    pub status: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanFailure {
    pub error: String,
}

/// Events produced by a scan session. Exactly one of `Complete` or `Failed`
/// closes a session and it is always the last event.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Progress(ScanProgress),
    Complete(Box<ScanSummary>),
    Failed(ScanFailure),
}

impl ScanEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanEvent::Progress(_))
    }

    /// Render as a server-sent event frame: `data: <json>\n\n`.
    pub fn to_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"complete":true,"error":"failed to encode event: {e}"}}"#)
        });
        format!("data: {json}\n\n")
    }
}

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    complete: bool,
    #[serde(flatten)]
    body: &'a T,
}

impl Serialize for ScanEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ScanEvent::Progress(p) => Frame { complete: false, body: p }.serialize(serializer),
            ScanEvent::Complete(s) => Frame { complete: true, body: s.as_ref() }.serialize(serializer),
            ScanEvent::Failed(f) => Frame { complete: true, body: f }.serialize(serializer),
        }
    }
}
