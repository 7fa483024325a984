use std::fmt::Display;
use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::inspector::ServiceInspector;
use crate::resolver::resolve_target;

pub const OS_PENDING: &str = "OS detection pending";
pub const OS_DISABLED: &str = "OS detection disabled";

/// Per-session OS guess. Written at most once, readable at any time without waiting.
#[derive(Debug, Default)]
pub struct OsInfoSlot {
    value: OnceLock<String>,
}

impl OsInfoSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, or [`OS_PENDING`] while the probe is still running.
    pub fn current(&self) -> String {
        self.value
            .get()
            .cloned()
            .unwrap_or_else(|| OS_PENDING.to_string())
    }

    /// Store the final value. Returns false if a value was already present.
    pub fn set(&self, value: String) -> bool {
        self.value.set(value).is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.value.get().is_some()
    }
}

fn failed(reason: impl Display) -> String {
    format!("OS detection failed: {reason}")
}

/// Re-resolve `target` and ask the inspector for its first OS match.
/// Every failure comes back as an `OS detection failed: ...` string.
pub async fn detect_os(target: &str, inspector: &dyn ServiceInspector) -> String {
    let resolved = match resolve_target(target).await {
        Ok(t) => t,
        Err(e) => {
            debug!(host = target, error = %e, "os probe could not resolve target");
            return failed("Could not resolve hostname");
        }
    };
    match inspector.os_match(resolved.ip).await {
        Ok(Some(name)) => name,
        Ok(None) => failed("No match found"),
        Err(e) => failed(e),
    }
}

/// Run [`detect_os`] on its own task and write the answer into `slot`.
pub fn spawn_os_probe(
    target: String,
    inspector: Arc<dyn ServiceInspector>,
    slot: Arc<OsInfoSlot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let info = detect_os(&target, inspector.as_ref()).await;
        info!(host = %target, os_info = %info, "os probe finished");
        slot.set(info);
    })
}

/// Wait for the OS probe, making sure the slot ends up written even if the task died.
pub async fn join_os_probe(handle: JoinHandle<()>, slot: &OsInfoSlot) {
    if let Err(e) = handle.await {
        warn!(error = %e, "os probe task did not finish");
        slot.set(failed(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, ScanError};
    use crate::types::Protocol;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;

    enum Os {
        Match(&'static str),
        NoMatch,
        Fail,
        Panic,
    }

    #[async_trait]
    impl ServiceInspector for Os {
        async fn product(&self, _ip: Ipv4Addr, _port: u16, _p: Protocol) -> Result<Option<String>> {
            Ok(None)
        }

        async fn os_match(&self, _ip: Ipv4Addr) -> Result<Option<String>> {
            match self {
                Os::Match(m) => Ok(Some(m.to_string())),
                Os::NoMatch => Ok(None),
                Os::Fail => Err(ScanError::Inspector("requires root".into())),
                Os::Panic => panic!("inspector crashed"),
            }
        }
    }

    #[test]
    fn slot_is_write_once() {
        let slot = OsInfoSlot::new();
        assert_eq!(slot.current(), OS_PENDING);
        assert!(slot.set("Linux".into()));
        assert!(!slot.set("Windows".into()));
        assert_eq!(slot.current(), "Linux");
    }

    #[tokio::test]
    async fn detect_os_outcomes() {
        assert_eq!(detect_os("127.0.0.1", &Os::Match("Linux 5.X")).await, "Linux 5.X");
        assert_eq!(
            detect_os("127.0.0.1", &Os::NoMatch).await,
            "OS detection failed: No match found"
        );
        assert_eq!(
            detect_os("127.0.0.1", &Os::Fail).await,
            "OS detection failed: inspector failed: requires root"
        );
        assert_eq!(
            detect_os("not-a-real-host.invalid", &Os::Match("x")).await,
            "OS detection failed: Could not resolve hostname"
        );
    }

    #[tokio::test]
    async fn panicking_probe_still_fills_slot() {
        let slot = Arc::new(OsInfoSlot::new());
        let handle = spawn_os_probe("127.0.0.1".into(), Arc::new(Os::Panic), slot.clone());
        join_os_probe(handle, &slot).await;
        assert!(slot.is_set());
        assert!(slot.current().starts_with("OS detection failed:"));
    }
}
