//! Hidden Player - supervised, occupancy-aware presence on a game server.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hidden_player::config::{Config, ConfigLoader};
use hidden_player::display;
use hidden_player::presence::{self, LoginConnector};
use hidden_player::probe::{ping_server, ServerProbe};
use hidden_player::supervisor::Supervisor;
use hidden_player::watchdog;

#[derive(Parser)]
#[command(
    name = "hidden-player",
    about = "Supervised, occupancy-aware presence client for a game server",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to ./hidden-player.toml, then the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor: keeps a presence child alive and serves the control socket.
    Supervise,
    /// Run the presence client, speaking IPC over stdin/stdout.
    Presence,
    /// Query a server's status once.
    Ping {
        /// Server host (defaults to the configured host).
        host: Option<String>,
        /// Server port (defaults to the configured port).
        #[arg(short, long)]
        port: Option<u16>,
        /// Give up after this many milliseconds.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Send an operator command to a running supervisor.
    Ctl {
        /// Control socket path (defaults to the configured path).
        #[arg(long)]
        socket: Option<PathBuf>,
        #[command(subcommand)]
        action: CtlAction,
    },
}

#[derive(Subcommand)]
enum CtlAction {
    /// Leave the server without reconnecting.
    Disconnect {
        /// Reason recorded by the child.
        reason: Option<String>,
    },
    /// Leave and rejoin the server.
    Reconnect,
    /// Send a chat message.
    Chat {
        /// Message text.
        message: String,
    },
    /// Show recent child output.
    Logs,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries IPC in the child and command output in the CLI.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, ExitCode> {
    let loader = path.map_or_else(ConfigLoader::new, |p| ConfigLoader::with_path(p.clone()));
    loader.load().map_err(|e| {
        display::print_error(&e.to_string());
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(code) => return code,
    };

    match cli.command {
        Commands::Supervise => run_supervisor(config, cli.config).await,
        Commands::Presence => run_presence(config).await,
        Commands::Ping {
            host,
            port,
            timeout_ms,
        } => {
            let host = host.unwrap_or(config.presence.host);
            let port = port.unwrap_or(config.presence.port);
            run_ping(&host, port, config.presence.protocol_version, timeout_ms).await
        }
        Commands::Ctl { socket, action } => {
            let socket = socket.unwrap_or(config.control.socket_path);
            run_ctl(socket, action).await
        }
    }
}

async fn run_presence(config: Config) -> ExitCode {
    let options = config.presence;
    tracing::info!(address = %options.address(), "Presence worker starting");
    let probe = Arc::new(ServerProbe::new(options.protocol_version));
    let exit = presence::serve(
        options,
        Arc::new(LoginConnector::default()),
        probe,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await;
    tracing::info!(?exit, "Presence worker stopped");
    ExitCode::SUCCESS
}

async fn run_ping(host: &str, port: u16, protocol_version: i32, timeout_ms: u64) -> ExitCode {
    match ping_server(host, port, protocol_version, Duration::from_millis(timeout_ms)).await {
        Ok(result) => {
            display::print_ping(&format!("{host}:{port}"), &result);
            ExitCode::SUCCESS
        }
        Err(e) => {
            display::print_error(&format!("{host}:{port}: {e}"));
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn run_ctl(socket: PathBuf, action: CtlAction) -> ExitCode {
    use hidden_player::control::{AdminRequest, AdminResponse, ControlClient};

    let (label, request) = match action {
        CtlAction::Disconnect { reason } => ("disconnect", AdminRequest::Disconnect { reason }),
        CtlAction::Reconnect => ("reconnect", AdminRequest::Reconnect),
        CtlAction::Chat { message } => ("chat", AdminRequest::Chat { message }),
        CtlAction::Logs => ("logs", AdminRequest::Logs),
    };

    match ControlClient::with_path(socket).request(&request).await {
        Ok(AdminResponse::Ok) => {
            display::print_ok(label);
            ExitCode::SUCCESS
        }
        Ok(AdminResponse::Logs { lines }) => {
            display::print_logs(&lines);
            ExitCode::SUCCESS
        }
        Ok(AdminResponse::Error { message }) => {
            display::print_error(&message);
            ExitCode::FAILURE
        }
        Err(e) => {
            display::print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(unix))]
async fn run_ctl(_socket: PathBuf, _action: CtlAction) -> ExitCode {
    display::print_error("the control socket is only available on unix");
    ExitCode::FAILURE
}

async fn run_supervisor(mut config: Config, config_path: Option<PathBuf>) -> ExitCode {
    // The child must read the same file.
    if let Some(path) = config_path {
        let mut args = vec!["--config".to_string(), path.display().to_string()];
        args.append(&mut config.supervisor.args);
        config.supervisor.args = args;
    }

    let supervisor = match Supervisor::new(config.supervisor.clone()) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            display::print_error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => display::print_supervisor_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event display fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let _watchdog = if config.watchdog.enabled {
        match watchdog::spawn(&config.watchdog) {
            Ok(handle) => Some(handle),
            Err(e) => {
                display::print_error(&e.to_string());
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    #[cfg(unix)]
    let _control = {
        use hidden_player::control::{handle_request, ControlServer};

        let handler_supervisor = supervisor.clone();
        let server = ControlServer::new(&config.control.socket_path);
        match server.start(move |request| {
            let supervisor = handler_supervisor.clone();
            async move { handle_request(&supervisor, request).await }
        }) {
            Ok(handle) => handle,
            Err(e) => {
                display::print_error(&e.to_string());
                return ExitCode::FAILURE;
            }
        }
    };

    if let Err(e) = supervisor.spawn().await {
        display::print_error(&e.to_string());
        supervisor.shutdown().await;
        return ExitCode::FAILURE;
    }

    wait_for_stop_signal().await;
    tracing::info!("Stopping supervisor");
    supervisor.shutdown().await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
