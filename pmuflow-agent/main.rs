use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pmuflow::common::cpuid::{mbm_scaling_factor, rdt_monitoring_supported, PerfmonInfo};
use pmuflow::common::{AccessFilter, AllowAll, LinuxPlatform, Platform, RangeFilter};
use pmuflow::{
    CollectorConfig, Coordinator, CoreMetricExporter, ErrorCode, LinkMetricExporter,
    MetricCollector, MonitorConfig, ProgramConfig, RawEventConfig, SocketMetricExporter,
    UncoreMetricExporter,
};

#[derive(Parser, Debug)]
#[command(name = "pmuflow")]
#[command(about = "Processor performance counter monitoring for Intel CPUs")]
struct Args {
    #[arg(
        long = "socket",
        help = "Sockets to export (can be specified multiple times, supports ranges: --socket 0 --socket 1 or --socket 0-1)",
        action = clap::ArgAction::Append
    )]
    sockets: Vec<String>,

    #[arg(
        long = "core",
        help = "Cores to export (supports ranges and comma-separated lists: --core 0-3,5-8 or --core 0-3 --core 5-8)",
        action = clap::ArgAction::Append
    )]
    cores: Vec<String>,

    #[arg(long, default_value_t = 1000, help = "Sampling interval in milliseconds")]
    interval_ms: u64,

    #[arg(long, default_value_t = 8080, help = "Port of the /metrics endpoint")]
    port: u16,

    #[arg(long, help = "Take over PMUs another agent left enabled")]
    force: bool,

    #[arg(long, help = "Read QoS monitoring from MSRs instead of resctrl")]
    no_resctrl: bool,

    #[arg(
        long = "event",
        help = "Raw event to program instead of the defaults, e.g. cha/config=0x0135,name=TOR_INSERTS/ (repeatable)",
        action = clap::ArgAction::Append
    )]
    events: Vec<String>,

    #[arg(long, help = "Count L1 instead of L0p residency on the xPI links")]
    xpi_l1: bool,

    #[arg(long, help = "Allow writes to any MSR or PCI register")]
    unrestricted: bool,

    #[arg(
        short,
        long,
        help = "Enable verbose logging (shows all MSR/PCI read/write operations)"
    )]
    verbose: bool,
}

struct AppState {
    core_exporter: Option<Arc<CoreMetricExporter>>,
    socket_exporter: Option<Arc<SocketMetricExporter>>,
    link_exporter: Option<Arc<LinkMetricExporter>>,
    uncore_exporter: Option<Arc<UncoreMetricExporter>>,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    pmuflow::gather_metrics!(buffer, encoder, state.core_exporter, "Core");
    pmuflow::gather_metrics!(buffer, encoder, state.socket_exporter, "Socket");
    pmuflow::gather_metrics!(buffer, encoder, state.link_exporter, "Link");
    pmuflow::gather_metrics!(buffer, encoder, state.uncore_exporter, "Server uncore");

    let content_type = encoder.format_type().to_string();
    (
        [("Content-Type", content_type)],
        String::from_utf8(buffer).unwrap_or_default(),
    )
}

fn check_permissions() {
    let msr_path = "/dev/cpu/0/msr";
    if std::fs::metadata(msr_path).is_err() {
        eprintln!("\nERROR: Cannot access {msr_path}\n\nThe MSR kernel module may not be loaded.\nRun: sudo modprobe msr\n");
        std::process::exit(1);
    }

    if let Err(e) = std::fs::File::open(msr_path) {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            eprintln!("\nERROR: Permission denied accessing {msr_path}\n\nRun as root or grant CAP_SYS_RAWIO.\n");
            std::process::exit(1);
        }
    }
}

/// Parse a list of range strings like ["0-3", "5", "8-11"] into Vec<u32>
/// Supports multiple formats:
/// - Single values: "0", "5"
/// - Ranges: "0-3" (inclusive)
/// - Comma-separated: "0,2,4"
/// - Mixed: "0-3,5,8-11"
fn parse_range_list(inputs: &[String]) -> Vec<u32> {
    let mut result = Vec::new();

    for input in inputs {
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some((start_str, end_str)) = part.split_once('-') {
                if let (Ok(start), Ok(end)) = (
                    start_str.trim().parse::<u32>(),
                    end_str.trim().parse::<u32>(),
                ) {
                    result.extend(start..=end);
                } else {
                    tracing::warn!("Failed to parse range: {}", part);
                }
            } else if let Ok(val) = part.parse::<u32>() {
                result.push(val);
            } else {
                tracing::warn!("Failed to parse value: {}", part);
            }
        }
    }

    result.sort_unstable();
    result.dedup();
    result
}

fn program_config(args: &Args) -> ProgramConfig {
    let filter: Arc<dyn AccessFilter> = if args.unrestricted {
        tracing::warn!("Register whitelist disabled");
        Arc::new(AllowAll)
    } else {
        Arc::new(RangeFilter::pmu_defaults())
    };

    let perfmon = PerfmonInfo::query();
    tracing::info!(
        "Architectural perfmon v{}: {} programmable counters of {} bits",
        perfmon.version,
        perfmon.gp_counters,
        perfmon.gp_width
    );

    ProgramConfig {
        force_reprogram: args.force,
        xpi_l1: args.xpi_l1,
        use_resctrl: !args.no_resctrl,
        mbm_scaling: rdt_monitoring_supported().then(mbm_scaling_factor),
        gp_counters: (perfmon.gp_counters > 0).then_some(perfmon.gp_counters as usize),
        filter,
        ..Default::default()
    }
}

/// Program the machine with the default events or the requested raw ones
fn program(coordinator: &mut Coordinator, events: &[String]) -> anyhow::Result<()> {
    let result = if events.is_empty() {
        coordinator.program()
    } else {
        let events = events
            .iter()
            .map(|e| RawEventConfig::parse(e))
            .collect::<pmuflow::Result<Vec<_>>>()?;
        coordinator.program_raw(&events)
    };

    if let Err(e) = &result {
        match e.code() {
            ErrorCode::MsrAccessDenied => {
                tracing::error!("Access to performance monitoring registers denied: {}", e)
            }
            ErrorCode::PmuBusy => {
                tracing::error!("{}; pass --force to take the counters over", e)
            }
            _ => tracing::error!("Programming failed: {}", e),
        }
    }
    Ok(result?)
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    tracing::info!("Installing signal handlers...");

    let ctrl_c = async {
        tracing::debug!("Waiting for Ctrl+C...");
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        tracing::info!("Ctrl+C received!");
    };

    #[cfg(unix)]
    let terminate = async {
        tracing::debug!("Waiting for SIGTERM...");
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
        tracing::info!("SIGTERM received!");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Shutdown triggered by Ctrl+C");
        },
        _ = terminate => {
            tracing::warn!("Shutdown triggered by SIGTERM");
        },
    }

    tracing::warn!("Shutdown signal received, initiating graceful shutdown...");
    cancel_token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    check_permissions();

    let platform: Arc<dyn Platform> = Arc::new(LinuxPlatform::new());
    let mut coordinator = Coordinator::new(platform, program_config(&args))?;
    program(&mut coordinator, &args.events)?;

    let config = MonitorConfig::select(
        coordinator.topology(),
        &parse_range_list(&args.cores),
        &parse_range_list(&args.sockets),
    );
    tracing::info!(
        "Monitoring {} sockets, {} cores",
        config.sockets.len(),
        config.cores.len()
    );

    let collector_config = CollectorConfig {
        interval: Duration::from_millis(args.interval_ms.max(1)),
    };
    let collector = MetricCollector::new(coordinator, &config, collector_config)?;

    let app_state = Arc::new(AppState {
        core_exporter: collector.core_exporter(),
        socket_exporter: collector.socket_exporter(),
        link_exporter: collector.link_exporter(),
        uncore_exporter: collector.uncore_exporter(),
    });

    let cancel_token = CancellationToken::new();
    let collection_handle = collector.start(cancel_token.clone());

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::warn!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
        .await?;

    // The server can also stop on its own; make sure the loop follows
    cancel_token.cancel();
    tracing::info!("Server shutdown complete, waiting for collection loop to finish...");
    if let Err(e) = collection_handle.await {
        tracing::error!("Collection loop failed: {}", e);
    }

    tracing::info!("All tasks completed, exiting");

    Ok(())
}
