use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portwatch_rs::config::{NmapConfig, ScanConfig, ServerConfig};
use portwatch_rs::inspector::{DisabledInspector, NmapInspector, ServiceInspector};
use portwatch_rs::ports::parse_port_range;
use portwatch_rs::scanner::Scanner;
use portwatch_rs::server;
use portwatch_rs::types::{PortState, Protocol, ScanEvent, ScanRequest, ScanSummary};

/// portwatch-rs — async TCP/UDP port scanner with live progress and best-effort OS detection.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "portwatch-rs",
    version,
    about = "Async TCP/UDP port scanner with live progress and best-effort OS detection.",
    long_about = None
)]
struct Cli {
    /// Run the HTTP server (streams scans as server-sent events).
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Address the HTTP server listens on.
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: String,

    /// Directory with the static web UI.
    #[arg(long = "ui-dir", default_value = "ui")]
    ui_dir: PathBuf,

    /// Host name or IPv4 address to scan once from the terminal.
    #[arg(long)]
    target: Option<String>,

    /// Port or inclusive range to scan, e.g. `22` or `1-1024`.
    #[arg(long, default_value = "1-1024", conflicts_with = "common")]
    ports: String,

    /// Scan the span of well-known ports (21-8080) instead of `--ports`.
    #[arg(long, default_value_t = false)]
    common: bool,

    /// Protocol to probe: tcp or udp.
    #[arg(long, default_value = "tcp")]
    protocol: String,

    /// Max concurrent port probes.
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Per-probe connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 1000)]
    timeout_ms: u64,

    /// Path to the nmap binary used for product and OS detection.
    #[arg(long = "nmap-path", default_value = "nmap")]
    nmap_path: String,

    /// Skip nmap entirely: no product strings, no OS detection.
    #[arg(long = "no-os-detect", default_value_t = false)]
    no_os_detect: bool,

    /// Write the final summary as pretty JSON to this path (terminal scans only).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let scan_config = ScanConfig {
        concurrency: cli.concurrency,
        connect_timeout: Duration::from_millis(cli.timeout_ms),
        os_detection: !cli.no_os_detect,
        ..ScanConfig::default()
    };
    let inspector = build_inspector(&cli).await?;
    let scanner = Scanner::new(scan_config, inspector);

    if cli.serve {
        let config = ServerConfig {
            bind: cli.bind.clone(),
            ui_dir: cli.ui_dir.clone(),
        };
        println!("Serving on http://{} (Ctrl+C to stop)", config.bind);
        tokio::select! {
            res = server::spawn_server(&config, scanner) => res?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        return Ok(());
    }

    let Some(target) = cli.target.as_deref() else {
        bail!("nothing to do: pass --serve or --target <host>");
    };
    let protocol: Protocol = cli.protocol.parse()?;
    let request = if cli.common {
        ScanRequest::common(target, protocol)?
    } else {
        let (start, end) = parse_port_range(&cli.ports)?;
        ScanRequest::new(target, start.into(), end.into(), protocol)?
    };

    let summary = run_terminal_scan(&scanner, request).await?;
    print_summary(&summary);
    if let Some(path) = cli.output.as_deref() {
        write_summary_json(path, &summary)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON summary to {}", path.display());
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn build_inspector(cli: &Cli) -> Result<Arc<dyn ServiceInspector>> {
    if cli.no_os_detect {
        warn!("deep inspection disabled; product and OS fields will stay empty");
        return Ok(Arc::new(DisabledInspector));
    }
    let nmap = NmapInspector::new(NmapConfig {
        nmap_path: cli.nmap_path.clone(),
        ..NmapConfig::default()
    });
    nmap.ensure_available()
        .await
        .context("nmap is not installed or not runnable (use --no-os-detect to scan without it)")?;
    Ok(Arc::new(nmap))
}

/// Run one scan, reporting progress on stderr. Ctrl+C cancels it cooperatively.
async fn run_terminal_scan(scanner: &Scanner, request: ScanRequest) -> Result<ScanSummary> {
    let mut handle = scanner.start(request);
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    while let Some(event) = handle.next().await {
        match event {
            ScanEvent::Progress(p) => {
                eprint!(
                    "\r{:5.1}%  open: {:<4} os: {:<40.40}",
                    p.progress,
                    p.open_ports.len(),
                    p.os_info
                );
            }
            ScanEvent::Complete(summary) => {
                eprintln!();
                return Ok(*summary);
            }
            ScanEvent::Failed(f) => {
                eprintln!();
                bail!("{}", f.error);
            }
        }
    }
    bail!("scan ended without a final report")
}

fn print_summary(s: &ScanSummary) {
    let mut service_w = "service".len();
    let mut product_w = "product".len();
    for r in &s.open_ports {
        service_w = service_w.max(r.service.len());
        product_w = product_w.max(r.product.len().min(40));
    }
    let port_w = 5usize;
    let state_w = "Invalid".len();

    println!("\nTarget   : {} ({})", s.actual_target, s.target);
    println!("Hostname : {}", s.target_hostname);
    println!("OS       : {}", s.os_info);
    println!(
        "Open     : {} {} port(s) in {} ({} -> {})",
        s.total_open_ports, s.scan_type, s.duration, s.start_time, s.end_time
    );
    if s.open_ports.is_empty() {
        return;
    }
    println!(
        "\n{:>port_w$}  {:<state_w$}  {:<service_w$}  {:<product_w$}",
        "port", "state", "service", "product",
    );
    println!(
        "{:-<port_w$}  {:-<state_w$}  {:-<service_w$}  {:-<product_w$}",
        "", "", "", "",
    );
    for r in &s.open_ports {
        let state = match r.state {
            PortState::Open => "Open",
            PortState::Invalid => "Invalid",
        };
        let detail: String = r
            .error
            .as_deref()
            .unwrap_or(&r.product)
            .chars()
            .take(40)
            .collect();
        println!(
            "{:>port_w$}  {:<state_w$}  {:<service_w$}  {:<product_w$}",
            r.port, state, r.service, detail,
        );
    }
}

fn write_summary_json(path: &std::path::Path, summary: &ScanSummary) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
