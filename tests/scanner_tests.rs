mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{progress_events, scanner_with, summary, ScriptedInspector};
use portwatch_rs::osprobe::OS_PENDING;
use portwatch_rs::scanner::INVALID_TARGET_MESSAGE;
use portwatch_rs::types::{PortState, Protocol, ScanEvent, ScanRequest};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn range_around(port: u16) -> (u32, u32) {
    let start = u32::from(port).saturating_sub(10).max(1);
    let end = (u32::from(port) + 10).min(65535);
    (start, end)
}

#[tokio::test]
async fn completed_scan_reports_open_port_sorted_with_full_progress() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let (start, end) = range_around(open);

    let inspector = Arc::new(ScriptedInspector {
        product: Some("Acme 1.0"),
        os: Some("Linux 6.1"),
        ..Default::default()
    });
    let scanner = scanner_with(inspector.clone(), 64);
    let request = ScanRequest::new("127.0.0.1", start, end, Protocol::Tcp).unwrap();
    let events = scanner.start(request).collect().await;

    let progress = progress_events(&events);
    assert_eq!(progress.len() as u32, end - start + 1);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let mut last = 0.0;
    for p in &progress {
        assert!(p.progress >= last, "progress went backwards");
        assert!(p.progress <= 99.0);
        last = p.progress;
    }

    let s = summary(&events);
    assert_eq!(s.progress, 100);
    assert_eq!(s.status, "completed");
    assert_eq!(s.target, "127.0.0.1");
    assert_eq!(s.target_hostname, "127.0.0.1");
    assert_eq!(s.actual_target, "127.0.0.1");
    assert_eq!(s.scan_type, Protocol::Tcp);
    assert_eq!(s.os_info, "Linux 6.1");
    assert_eq!(s.total_open_ports, s.open_ports.len());
    assert!(s.open_ports.windows(2).all(|w| w[0].port < w[1].port));
    assert!(s
        .open_ports
        .iter()
        .all(|r| (start..=end).contains(&u32::from(r.port))));

    let found = s
        .open_ports
        .iter()
        .find(|r| r.port == open)
        .expect("listening port reported");
    assert_eq!(found.state, PortState::Open);
    assert_eq!(found.protocol, Protocol::Tcp);
    assert_eq!(found.product, "Acme 1.0");
    assert!(inspector.product_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(inspector.os_calls.load(Ordering::SeqCst), 1);

    let v = serde_json::to_value(&events[events.len() - 1]).unwrap();
    assert_eq!(v["complete"], true);
    assert_eq!(v["progress"], 100);
    assert_eq!(v["status"], "completed");
}

#[tokio::test]
async fn unresolvable_target_emits_single_error_event() {
    let inspector = Arc::new(ScriptedInspector::default());
    let scanner = scanner_with(inspector.clone(), 64);
    let request = ScanRequest::new("not-a-real-host.invalid", 20, 25, Protocol::Tcp).unwrap();
    let events = scanner.start(request).collect().await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        ScanEvent::Failed(f) => assert_eq!(f.error, INVALID_TARGET_MESSAGE),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        events[0].to_frame(),
        "data: {\"complete\":true,\"error\":\"Please enter a valid hostname or IP\"}\n\n"
    );
    assert_eq!(inspector.os_calls.load(Ordering::SeqCst), 0);
    assert_eq!(inspector.product_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slow_os_probe_does_not_block_progress() {
    let inspector = Arc::new(ScriptedInspector {
        os: Some("FreeBSD 14"),
        os_delay: Duration::from_millis(400),
        ..Default::default()
    });
    let scanner = scanner_with(inspector, 64);
    let request = ScanRequest::new("127.0.0.1", 1, 5, Protocol::Tcp).unwrap();
    let events = scanner.start(request).collect().await;

    let progress = progress_events(&events);
    assert_eq!(progress.len(), 5);
    assert_eq!(progress[0].os_info, OS_PENDING);
    assert_eq!(summary(&events).os_info, "FreeBSD 14");
}

#[tokio::test]
async fn failing_os_probe_is_folded_into_os_info() {
    let inspector = Arc::new(ScriptedInspector::default());
    let scanner = scanner_with(inspector, 64);
    let request = ScanRequest::new("127.0.0.1", 1, 3, Protocol::Tcp).unwrap();
    let events = scanner.start(request).collect().await;

    let s = summary(&events);
    assert!(s.os_info.starts_with("OS detection failed:"), "{}", s.os_info);
}

#[tokio::test]
async fn cancelled_before_first_completion_emits_only_summary() {
    let inspector = Arc::new(ScriptedInspector {
        os: Some("Linux"),
        ..Default::default()
    });
    let scanner = scanner_with(inspector, 64);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = ScanRequest::new("127.0.0.1", 1, 200, Protocol::Tcp).unwrap();
    let events = scanner.start_with_cancel(request, cancel).collect().await;

    assert!(progress_events(&events).is_empty());
    assert_eq!(events.len(), 1);
    assert_eq!(summary(&events).status, "completed");
}

#[tokio::test]
async fn cancellation_mid_scan_stops_progress() {
    let inspector = Arc::new(ScriptedInspector {
        os: Some("Linux"),
        ..Default::default()
    });
    // A one-slot channel keeps the orchestrator in lock-step with this consumer.
    let scanner = scanner_with(inspector, 1);
    let request = ScanRequest::new("127.0.0.1", 40000, 40299, Protocol::Tcp).unwrap();
    let mut handle = scanner.start(request);

    let mut seen = 0;
    while seen < 3 {
        match handle.next().await {
            Some(ScanEvent::Progress(_)) => seen += 1,
            other => panic!("unexpected event before cancel: {other:?}"),
        }
    }
    handle.cancel();

    let rest = handle.collect().await;
    let after = progress_events(&rest).len();
    assert!(after <= 3, "{after} progress events after cancel");
    assert!(seen + after < 300);
    assert!(matches!(rest.last(), Some(ScanEvent::Complete(_))));
}

#[tokio::test]
async fn common_preset_scans_full_span() {
    let inspector = Arc::new(ScriptedInspector {
        os: Some("Linux"),
        ..Default::default()
    });
    let scanner = scanner_with(inspector, 256);
    let events = scanner
        .start_common("127.0.0.1", Protocol::Tcp)
        .unwrap()
        .collect()
        .await;

    assert_eq!(progress_events(&events).len(), 8080 - 21 + 1);
    let s = summary(&events);
    assert!(s.open_ports.iter().all(|r| (21..=8080).contains(&r.port)));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn socket_errors_reach_the_summary_as_invalid() {
    let inspector = Arc::new(ScriptedInspector {
        os: Some("Linux"),
        ..Default::default()
    });
    let scanner = scanner_with(inspector.clone(), 16);
    // UDP connect to broadcast is refused locally with EACCES.
    let request = ScanRequest::new("255.255.255.255", 9, 9, Protocol::Udp).unwrap();
    let events = scanner.start(request).collect().await;

    let progress = progress_events(&events);
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].open_ports.len(), 1);

    let s = summary(&events);
    assert_eq!(s.total_open_ports, 1);
    let r = &s.open_ports[0];
    assert_eq!(r.port, 9);
    assert_eq!(r.state, PortState::Invalid);
    assert!(r.error.is_some());
    assert_eq!(inspector.product_calls.load(Ordering::SeqCst), 0);
}
