use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ::time::{macros::format_description, OffsetDateTime};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::Result;
use crate::inspector::ServiceInspector;
use crate::osprobe::{join_os_probe, spawn_os_probe, OsInfoSlot, OS_DISABLED};
use crate::prober::probe_port;
use crate::resolver::{display_hostname, resolve_target, ResolvedTarget, UNKNOWN_HOSTNAME};
use crate::types::{
    PortResult, Protocol, ScanEvent, ScanFailure, ScanProgress, ScanRequest, ScanSummary,
};

/// Error text of the terminal frame sent when the target cannot be resolved.
pub const INVALID_TARGET_MESSAGE: &str = "Please enter a valid hostname or IP";

/// Drives scan sessions. Cheap to clone; every session gets its own state.
#[derive(Clone)]
pub struct Scanner {
    config: ScanConfig,
    inspector: Arc<dyn ServiceInspector>,
}

/// Receiving end of a running session plus its cancellation token.
#[derive(Debug)]
pub struct ScanHandle {
    events: mpsc::Receiver<ScanEvent>,
    cancel: CancellationToken,
}

impl ScanHandle {
    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Ask the session to stop. Returns immediately; probes already in flight finish on their own.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn into_parts(self) -> (mpsc::Receiver<ScanEvent>, CancellationToken) {
        (self.events, self.cancel)
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<ScanEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.events.recv().await {
            out.push(ev);
        }
        out
    }
}

/// State owned by one run of the orchestrator.
struct ScanSession {
    request: ScanRequest,
    target: ResolvedTarget,
    start_time: OffsetDateTime,
    started: Instant,
    results: Vec<PortResult>,
    completed: u64,
    os_info: Arc<OsInfoSlot>,
    cancel: CancellationToken,
}

impl ScanSession {
    fn progress(&self) -> ScanProgress {
        ScanProgress {
            progress: progress_percent(self.completed, self.request.total_ports()),
            open_ports: self.results.clone(),
            os_info: self.os_info.current(),
        }
    }

    fn finish(mut self, hostname: String) -> ScanSummary {
        self.results.sort_by_key(|r| r.port);
        let end_time = now_local();
        ScanSummary {
            progress: 100,
            total_open_ports: self.results.len(),
            open_ports: self.results,
            target: self.target.ip.to_string(),
            target_hostname: hostname,
            start_time: format_timestamp(self.start_time),
            end_time: format_timestamp(end_time),
            duration: format_duration(self.started.elapsed()),
            os_info: self.os_info.current(),
            scan_type: self.request.protocol(),
            actual_target: self.request.target().to_string(),
            status: "completed".to_string(),
        }
    }
}

impl Scanner {
    pub fn new(config: ScanConfig, inspector: Arc<dyn ServiceInspector>) -> Self {
        Self { config, inspector }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Start a session on a background task with a fresh cancellation token.
    pub fn start(&self, request: ScanRequest) -> ScanHandle {
        self.start_with_cancel(request, CancellationToken::new())
    }

    /// Variant that accepts a caller-owned `CancellationToken`.
    pub fn start_with_cancel(&self, request: ScanRequest, cancel: CancellationToken) -> ScanHandle {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let this = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { this.run(request, token, tx).await });
        ScanHandle { events: rx, cancel }
    }

    /// Scan every port between the lowest and highest well-known port.
    pub fn start_common(&self, target: &str, protocol: Protocol) -> Result<ScanHandle> {
        Ok(self.start(ScanRequest::common(target, protocol)?))
    }

    /// Run one session to its terminal event, sending everything into `tx`.
    pub async fn run(&self, request: ScanRequest, cancel: CancellationToken, tx: mpsc::Sender<ScanEvent>) {
        let start_time = now_local();
        let started = Instant::now();

        let target = match resolve_target(request.target()).await {
            Ok(t) => t,
            Err(e) => {
                warn!(host = request.target(), error = %e, "target resolution failed");
                let failure = ScanFailure { error: INVALID_TARGET_MESSAGE.to_string() };
                let _ = tx.send(ScanEvent::Failed(failure)).await;
                return;
            }
        };
        info!(
            host = request.target(),
            ip = %target.ip,
            protocol = %request.protocol(),
            start = request.start_port(),
            end = request.end_port(),
            "scan started"
        );

        let os_info = Arc::new(OsInfoSlot::new());
        let os_task = if self.config.os_detection {
            Some(spawn_os_probe(
                request.target().to_string(),
                self.inspector.clone(),
                os_info.clone(),
            ))
        } else {
            os_info.set(OS_DISABLED.to_string());
            None
        };
        let hostname_task = {
            let target = target.clone();
            tokio::spawn(async move { display_hostname(&target).await })
        };

        let mut session = ScanSession {
            request,
            target,
            start_time,
            started,
            results: Vec::new(),
            completed: 0,
            os_info,
            cancel,
        };

        let mut set = self.spawn_probes(&session);
        let mut consumer_gone = false;
        while let Some(joined) = set.join_next().await {
            if session.cancel.is_cancelled() {
                info!(
                    completed = session.completed,
                    total = session.request.total_ports(),
                    "scan cancelled"
                );
                break;
            }
            match joined {
                Ok(Some(result)) => session.results.push(result),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "probe task failed"),
            }
            session.completed += 1;
            if tx.send(ScanEvent::Progress(session.progress())).await.is_err() {
                debug!("event consumer went away, stopping scan");
                session.cancel.cancel();
                consumer_gone = true;
                break;
            }
        }
        // Probes still in flight run to completion; their results are dropped.
        set.detach_all();

        if consumer_gone {
            if let Some(task) = os_task {
                task.abort();
            }
            hostname_task.abort();
            return;
        }

        if let Some(task) = os_task {
            let abort = task.abort_handle();
            tokio::select! {
                _ = join_os_probe(task, &session.os_info) => {}
                _ = tx.closed() => {
                    debug!("event consumer went away while waiting for os probe");
                    abort.abort();
                    hostname_task.abort();
                    return;
                }
            }
        }

        let hostname = hostname_task
            .await
            .unwrap_or_else(|_| UNKNOWN_HOSTNAME.to_string());
        let summary = session.finish(hostname);
        info!(
            ip = %summary.target,
            open = summary.total_open_ports,
            duration = %summary.duration,
            "scan finished"
        );
        let _ = tx.send(ScanEvent::Complete(Box::new(summary))).await;
    }

    /// One task per port. A semaphore keeps at most `concurrency` probes running.
    fn spawn_probes(&self, session: &ScanSession) -> JoinSet<Option<PortResult>> {
        let sem = Arc::new(Semaphore::new(self.config.concurrency.clamp(1, 5_000)));
        let ip: Ipv4Addr = session.target.ip;
        let protocol = session.request.protocol();
        let timeout = self.config.connect_timeout;
        let mut set = JoinSet::new();

        for port in session.request.ports() {
            let sem = sem.clone();
            let cancel = session.cancel.clone();
            let inspector = self.inspector.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                probe_port(ip, port, protocol, timeout, inspector.as_ref()).await
            });
        }
        set
    }
}

/// Percentage of completed probes, held at 99 until the terminal event.
pub fn progress_percent(completed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64 * 100.0).min(99.0)
}

/// `"<m> min, <s> sec"` from one minute up, `"<s> sec"` below.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (minutes, seconds) = (secs / 60, secs % 60);
    if minutes > 0 {
        format!("{minutes} min, {seconds} sec")
    } else {
        format!("{seconds} sec")
    }
}

fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn format_timestamp(t: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    t.format(fmt)
        .unwrap_or_else(|_| String::from("1970-01-01 00:00:00"))
}
