#![allow(dead_code)]
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portwatch_rs::config::ScanConfig;
use portwatch_rs::error::{Result, ScanError};
use portwatch_rs::inspector::ServiceInspector;
use portwatch_rs::scanner::Scanner;
use portwatch_rs::types::{Protocol, ScanEvent, ScanProgress, ScanSummary};

/// Inspector double: fixed answers, optional OS delay, call counters.
#[derive(Default)]
pub struct ScriptedInspector {
    pub product: Option<&'static str>,
    pub os: Option<&'static str>,
    pub os_delay: Duration,
    pub product_calls: AtomicUsize,
    pub os_calls: AtomicUsize,
}

#[async_trait]
impl ServiceInspector for ScriptedInspector {
    async fn product(&self, _ip: Ipv4Addr, _port: u16, _protocol: Protocol) -> Result<Option<String>> {
        self.product_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.product.map(str::to_string))
    }

    async fn os_match(&self, _ip: Ipv4Addr) -> Result<Option<String>> {
        self.os_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.os_delay).await;
        match self.os {
            Some(name) => Ok(Some(name.to_string())),
            None => Err(ScanError::Inspector("no privileges".into())),
        }
    }
}

pub fn scanner_with(inspector: Arc<ScriptedInspector>, event_buffer: usize) -> Scanner {
    let config = ScanConfig {
        connect_timeout: Duration::from_millis(500),
        event_buffer,
        ..ScanConfig::default()
    };
    Scanner::new(config, inspector)
}

pub fn progress_events(events: &[ScanEvent]) -> Vec<&ScanProgress> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Progress(p) => Some(p),
            _ => None,
        })
        .collect()
}

pub fn summary(events: &[ScanEvent]) -> &ScanSummary {
    match events.last() {
        Some(ScanEvent::Complete(s)) => s,
        other => panic!("expected a Complete event last, got {other:?}"),
    }
}
