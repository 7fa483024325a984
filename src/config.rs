use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one scan session.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Upper bound on concurrently running port probes.
    pub concurrency: usize,
    /// Connect (TCP) or reply (UDP) timeout per probe.
    pub connect_timeout: Duration,
    /// Depth of the event channel between the orchestrator and its consumer.
    pub event_buffer: usize,
    /// Run the OS fingerprint probe alongside the port scan.
    pub os_detection: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            connect_timeout: Duration::from_secs(1),
            event_buffer: 64,
            os_detection: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NmapConfig {
    pub nmap_path: String,
    /// Limit for a single-port service/version probe.
    pub service_timeout: Duration,
    /// Limit for the whole-host OS fingerprint run.
    pub os_timeout: Duration,
}

impl Default for NmapConfig {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            service_timeout: Duration::from_secs(60),
            os_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Directory served for any path not matched by the API routes.
    pub ui_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            ui_dir: PathBuf::from("ui"),
        }
    }
}
