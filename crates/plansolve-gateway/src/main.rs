//! plan/solve gateway — WebSocket front door for a Plan→Solve agent pipeline.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use plansolve_core::BindMode;
use plansolve_gateway::{DemoSessionFactory, GatewayConfig, WebSocketServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "plansolve-gateway", about = "Plan/solve WebSocket gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket gateway server
    Serve {
        #[arg(short, long, default_value = "8765")]
        port: u16,
        #[arg(short, long, default_value = "loopback")]
        bind: String,
        #[arg(long, default_value = "60")]
        heartbeat_interval_secs: u64,
        #[arg(long, default_value = "1000")]
        outbound_queue_size: usize,
        #[arg(long, default_value = "75")]
        coalesce_window_ms: u64,
        #[arg(long)]
        event_namespace: Option<String>,
        #[arg(long, default_value = "true")]
        broadcast_tasks: bool,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            port,
            bind,
            heartbeat_interval_secs,
            outbound_queue_size,
            coalesce_window_ms,
            event_namespace,
            broadcast_tasks,
        }) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "plansolve=info,tower_http=info".into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let bind_mode = match bind.as_str() {
                "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
                _ => BindMode::Lan,
            };

            let config = GatewayConfig {
                bind: bind_mode,
                port,
                heartbeat_interval_secs,
                outbound_queue_size,
                coalesce_window_ms,
                event_namespace,
                broadcast_tasks,
                ..GatewayConfig::default()
            };

            let factory = Arc::new(DemoSessionFactory::new());
            let server = WebSocketServer::new(config, factory);
            server.serve().await?;
        }

        Some(Commands::Version) => {
            println!("plansolve-gateway v{}", env!("CARGO_PKG_VERSION"));
        }

        None => {
            eprintln!("no subcommand given; try `plansolve-gateway serve`");
        }
    }

    Ok(())
}
