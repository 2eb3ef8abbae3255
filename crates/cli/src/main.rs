use clap::{Parser, Subcommand};
use lib::config::{self, GatewayConfig, SupervisorConfig};
use lib::metrics::{MetricsSink, PrometheusMetrics};
use lib::quake::{eula, OobClient};
use lib::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "q3gate")]
#[command(about = "Browser gateway and supervisor for a Quake 3 dedicated server", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the game server under supervision together with the gateway.
    Server {
        /// YAML game configuration; the server is restarted when it changes (default: Q3GATE_CONFIG)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Game assets root (default: Q3GATE_ASSETS_DIR or ./assets)
        #[arg(long, value_name = "DIR")]
        assets_dir: Option<PathBuf>,

        /// Gateway listen address (default: Q3GATE_CLIENT_ADDR or <host-ipv4>:8080)
        #[arg(long, value_name = "ADDR")]
        client_addr: Option<String>,

        /// Game server address (default: Q3GATE_SERVER_ADDR or <host-ipv4>:27960)
        #[arg(long, value_name = "ADDR")]
        server_addr: Option<String>,

        /// Seconds between configuration file checks
        #[arg(long, value_name = "SECS", default_value_t = 15)]
        watch_interval: u64,

        /// Dedicated server executable
        #[arg(long, default_value = config::DEFAULT_BINARY)]
        binary: String,

        /// YAML map rotation written to baseq3/maps.cfg (default: Q3GATE_MAPS or the built-in rotation)
        #[arg(long, value_name = "PATH")]
        maps: Option<PathBuf>,

        /// Agree to the Quake 3 demo EULA
        #[arg(long)]
        agree_eula: bool,
    },

    /// Run only the gateway in front of an already running game server.
    Proxy {
        /// Gateway listen address (default: Q3GATE_CLIENT_ADDR or <host-ipv4>:8080)
        #[arg(long, value_name = "ADDR")]
        client_addr: Option<String>,

        /// Game server address (default: Q3GATE_SERVER_ADDR or <host-ipv4>:27960)
        #[arg(long, value_name = "ADDR")]
        server_addr: Option<String>,
    },

    /// Query a game server with getinfo and print the result as JSON.
    Info {
        #[arg(value_name = "ADDR")]
        addr: String,
    },

    /// Query a game server with getstatus and print the result as JSON.
    Status {
        #[arg(value_name = "ADDR")]
        addr: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("q3gate {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Server {
            config,
            assets_dir,
            client_addr,
            server_addr,
            watch_interval,
            binary,
            maps,
            agree_eula,
        }) => {
            let args = ServerArgs {
                config,
                assets_dir,
                client_addr,
                server_addr,
                watch_interval,
                binary,
                maps,
                agree_eula,
            };
            if let Err(e) = run_server(args).await {
                log::error!("server failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Proxy {
            client_addr,
            server_addr,
        }) => {
            if let Err(e) = run_proxy(client_addr, server_addr).await {
                log::error!("proxy failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Info { addr }) => {
            if let Err(e) = run_info(&addr).await {
                log::error!("info failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { addr }) => {
            if let Err(e) = run_status(&addr).await {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

struct ServerArgs {
    config: Option<PathBuf>,
    assets_dir: Option<PathBuf>,
    client_addr: Option<String>,
    server_addr: Option<String>,
    watch_interval: u64,
    binary: String,
    maps: Option<PathBuf>,
    agree_eula: bool,
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    if !args.agree_eula {
        println!("{}", eula::Q3_DEMO_EULA);
    }
    eula::require_agreement(args.agree_eula)?;

    let gateway = GatewayConfig {
        client_addr: config::resolve_client_addr(args.client_addr)?,
        server_addr: config::resolve_server_addr(args.server_addr)?,
    };
    let mut supervisor_config = SupervisorConfig::new(gateway.server_addr.clone());
    supervisor_config.assets_dir = config::resolve_assets_dir(args.assets_dir);
    supervisor_config.config_file = config::resolve_config_file(args.config);
    supervisor_config.watch_interval = Duration::from_secs(args.watch_interval.max(1));
    supervisor_config.binary = args.binary;
    supervisor_config.maps_file = config::resolve_maps_file(args.maps);

    let metrics = Arc::new(PrometheusMetrics::new()?);
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let supervisor = Supervisor::new(supervisor_config, sink)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let supervisor_task = {
        let cancel = cancel.clone();
        async move {
            let result = supervisor.run(cancel.clone()).await;
            // Either side stopping stops the other.
            cancel.cancel();
            result
        }
    };
    let gateway_task = {
        let cancel = cancel.clone();
        async move {
            let result = lib::gateway::run_gateway(gateway, metrics, cancel.clone()).await;
            cancel.cancel();
            result
        }
    };

    let (supervised, served) = tokio::join!(supervisor_task, gateway_task);
    supervised?;
    served?;
    Ok(())
}

async fn run_proxy(client_addr: Option<String>, server_addr: Option<String>) -> anyhow::Result<()> {
    let gateway = GatewayConfig {
        client_addr: config::resolve_client_addr(client_addr)?,
        server_addr: config::resolve_server_addr(server_addr)?,
    };
    log::info!("proxying {} to {}", gateway.client_addr, gateway.server_addr);
    let metrics = Arc::new(PrometheusMetrics::new()?);
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    lib::gateway::run_gateway(gateway, metrics, cancel).await?;
    Ok(())
}

async fn run_info(addr: &str) -> anyhow::Result<()> {
    let info = OobClient::new().get_info(addr).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn run_status(addr: &str) -> anyhow::Result<()> {
    let status = OobClient::new().get_status(addr).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => return,
    }
    log::info!("shutdown signal received");
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_flags_parse() {
        let cli = Cli::try_parse_from(["q3gate", "server", "--maps", "maps.yaml", "--agree-eula"])
            .unwrap();
        match cli.command {
            Some(Commands::Server { maps, agree_eula, .. }) => {
                assert_eq!(maps, Some(PathBuf::from("maps.yaml")));
                assert!(agree_eula);
            }
            _ => panic!("expected server command"),
        }

        let cli = Cli::try_parse_from(["q3gate", "server"]).unwrap();
        match cli.command {
            Some(Commands::Server { maps, agree_eula, .. }) => {
                assert!(maps.is_none());
                assert!(!agree_eula);
            }
            _ => panic!("expected server command"),
        }
    }

    #[tokio::test]
    async fn server_refuses_without_eula_agreement() {
        let args = ServerArgs {
            config: None,
            assets_dir: None,
            client_addr: Some("127.0.0.1:0".to_string()),
            server_addr: Some("127.0.0.1:27960".to_string()),
            watch_interval: 15,
            binary: "/nonexistent/q3gate-test-binary".to_string(),
            maps: None,
            agree_eula: false,
        };
        let err = run_server(args).await.unwrap_err();
        assert!(err.to_string().contains("EULA"));
    }
}
