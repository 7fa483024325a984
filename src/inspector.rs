//! Deep inspection backed by an external `nmap` binary.
//!
//! The scanner only needs two answers from it: a product string for one open
//! port and the first OS match for a host. Both are behind [`ServiceInspector`]
//! so the orchestrator can be driven without the tool installed.
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::config::NmapConfig;
use crate::error::{Result, ScanError};
use crate::types::Protocol;

#[async_trait]
pub trait ServiceInspector: Send + Sync {
    /// Product/version string for a single open port, if the tool reports one.
    async fn product(&self, ip: Ipv4Addr, port: u16, protocol: Protocol) -> Result<Option<String>>;

    /// Name of the first OS match reported for the host, if any.
    async fn os_match(&self, ip: Ipv4Addr) -> Result<Option<String>>;
}

/// Inspector that never calls anything. Used when deep inspection is switched off.
#[derive(Debug, Default, Clone)]
pub struct DisabledInspector;

#[async_trait]
impl ServiceInspector for DisabledInspector {
    async fn product(&self, _ip: Ipv4Addr, _port: u16, _protocol: Protocol) -> Result<Option<String>> {
        Ok(None)
    }

    async fn os_match(&self, _ip: Ipv4Addr) -> Result<Option<String>> {
        Err(ScanError::Inspector("deep inspection disabled".into()))
    }
}

#[derive(Debug, Clone)]
pub struct NmapInspector {
    config: NmapConfig,
}

impl NmapInspector {
    pub fn new(config: NmapConfig) -> Self {
        Self { config }
    }

    /// Check that the configured binary can be executed.
    pub async fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.config.nmap_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                ScanError::Inspector(format!("cannot execute {}: {e}", self.config.nmap_path))
            })?;
        if !status.success() {
            return Err(ScanError::Inspector(format!(
                "{} --version exited with {status}",
                self.config.nmap_path
            )));
        }
        Ok(())
    }

    async fn run(&self, args: &[String], limit: Duration) -> Result<String> {
        debug!(nmap = %self.config.nmap_path, ?args, "running nmap");
        let mut cmd = Command::new(&self.config.nmap_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match time::timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ScanError::Inspector(format!("failed to execute nmap: {e}"))),
            Err(_) => {
                return Err(ScanError::Inspector(format!(
                    "nmap timed out after {}s",
                    limit.as_secs()
                )))
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let msg = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(ScanError::Inspector(format!(
                "nmap exited with {}: {}",
                output.status,
                msg.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ServiceInspector for NmapInspector {
    async fn product(&self, ip: Ipv4Addr, port: u16, protocol: Protocol) -> Result<Option<String>> {
        let mut args = vec!["-sV".to_string(), "-Pn".to_string()];
        if protocol == Protocol::Udp {
            args.push("-sU".to_string());
        }
        args.extend(["-p".to_string(), port.to_string()]);
        args.extend(["-oX".to_string(), "-".to_string(), ip.to_string()]);
        let xml = self.run(&args, self.config.service_timeout).await?;
        parse_product(&xml, port, protocol)
    }

    async fn os_match(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        let args = [
            "-O".to_string(),
            "--osscan-guess".to_string(),
            "-oX".to_string(),
            "-".to_string(),
            ip.to_string(),
        ];
        let xml = self.run(&args, self.config.os_timeout).await?;
        parse_first_os_match(&xml)
    }
}

fn xml_error(e: quick_xml::Error) -> ScanError {
    ScanError::Inspector(format!("unreadable nmap XML: {e}"))
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    let Some(a) = e
        .try_get_attribute(name)
        .map_err(|err| xml_error(err.into()))?
    else {
        return Ok(None);
    };
    let value = a.unescape_value().map_err(xml_error)?;
    Ok(Some(value.into_owned()))
}

/// Extract the `product` attribute of the `<service>` belonging to `port`.
pub fn parse_product(xml: &str, port: u16, protocol: Protocol) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut in_port = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"port" => {
                    let id = attr(&e, b"portid")?.and_then(|v| v.parse::<u16>().ok());
                    let proto = attr(&e, b"protocol")?;
                    in_port = id == Some(port)
                        && proto.map_or(true, |p| p.eq_ignore_ascii_case(protocol.as_str()));
                }
                b"service" if in_port => {
                    return Ok(attr(&e, b"product")?.filter(|p| !p.is_empty()));
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"port" => in_port = false,
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Extract the `name` of the first `<osmatch>` element.
pub fn parse_first_os_match(xml: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"osmatch" => {
                if let Some(name) = attr(&e, b"name")?.filter(|n| !n.is_empty()) {
                    return Ok(Some(name));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}
