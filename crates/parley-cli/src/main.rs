//! Parley CLI
//!
//! Relay, peer, and supervisor for the Parley chat and file relay.

mod config;
mod logging;

use clap::{Parser, Subcommand};
use parley_core::{DownloadStore, PortSpec};
use parley_peer::{FixedName, Peer, PeerError, PeerEvent};
use parley_relay::{RelayHandle, RelayServer, RelayServerConfig};
use parley_supervisor::{Supervisor, resolve_ports};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use config::Config;

/// Parley - TCP chat and file relay
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: <config dir>/parley/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay; stdin lines are announced to every peer
    Relay {
        /// Listening port
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Connect to a relay and chat; stdin lines are sent to the current target
    Peer {
        /// Relay host
        #[arg(long)]
        host: Option<String>,

        /// Candidate ports (`5000`, `5000,5001`, or `5000-5003`)
        #[arg(short, long)]
        ports: Option<PortSpec>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Use the colon-delimited wire format
        #[arg(long)]
        legacy: bool,

        /// Directory for received files
        #[arg(short, long)]
        downloads: Option<PathBuf>,
    },

    /// Keep relays alive, restarting them when their port stops answering
    Supervise {
        /// Relay host
        #[arg(long)]
        host: Option<String>,

        /// First port of the supervised range
        #[arg(short, long)]
        base_port: Option<u16>,

        /// Number of contiguous relay instances
        #[arg(short, long)]
        instances: Option<u16>,

        /// Explicit ports, comma separated
        #[arg(long, value_delimiter = ',')]
        ports: Option<Vec<u16>>,

        /// Restart command; `{port}` is replaced by the port
        #[arg(long)]
        command: Option<String>,

        /// Log file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Relay { port, bind } => {
            let mut config = config;
            if let Some(port) = port {
                config.relay.port = port;
            }
            if let Some(bind) = bind {
                config.relay.bind = bind;
            }
            config.validate()?;
            logging::init(&config.logging.level, cli.verbose, None)?;
            run_relay(&config).await?;

            // Stopping the relay ends the process so supervisors see the port close.
            std::process::exit(0);
        }
        Commands::Peer {
            host,
            ports,
            name,
            legacy,
            downloads,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.peer.host = host;
            }
            if let Some(ports) = ports {
                config.peer.ports = ports;
            }
            if name.is_some() {
                config.peer.name = name;
            }
            if legacy {
                config.peer.legacy_framing = true;
            }
            if let Some(dir) = downloads {
                config.peer.downloads_dir = dir;
            }
            config.validate()?;
            logging::init(&config.logging.level, cli.verbose, None)?;
            run_peer(&config).await?;
            std::process::exit(0);
        }
        Commands::Supervise {
            host,
            base_port,
            instances,
            ports,
            command,
            log_file,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.supervisor.host = host;
            }
            if let Some(port) = base_port {
                config.supervisor.base_port = port;
            }
            if instances.is_some() {
                config.supervisor.instances = instances;
            }
            if ports.is_some() {
                config.supervisor.ports = ports;
            }
            if let Some(command) = command {
                config.supervisor.command = command;
            }
            if let Some(path) = log_file {
                config.supervisor.log_file = path;
            }
            config.validate()?;
            let _guard = logging::init(
                &config.logging.level,
                cli.verbose,
                Some(&config.supervisor.log_file),
            )?;
            run_supervisor(&config).await?;
        }
    }

    Ok(())
}

/// Run the relay until `/quit`, Ctrl+C, or SIGTERM
async fn run_relay(config: &Config) -> anyhow::Result<()> {
    let addr = config.relay_addr()?;
    let server = RelayServer::bind_with_config(
        addr,
        RelayServerConfig {
            max_payload: config.relay.max_payload_bytes,
        },
    )
    .await?;
    let handle = server.handle();

    println!("Parley relay {}", env!("CARGO_PKG_VERSION"));
    println!("Listening on {}", server.local_addr());
    println!("Type to announce to everyone, /file <path> to send a file, /quit to stop");

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown requested");
            handle.stop().await;
        });
    }
    tokio::spawn(relay_console(handle));

    server.run().await?;
    Ok(())
}

async fn relay_console(handle: RelayHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            handle.stop().await;
            return;
        }

        let result = match line.strip_prefix("/file ") {
            Some(path) => handle.announce_file(Path::new(path.trim())).await,
            None => handle.announce_text(line).await,
        };
        match result {
            Ok(recipients) => tracing::debug!("Announced to {} peers", recipients),
            Err(e) => eprintln!("{e}"),
        }
    }

    // End of input (e.g. launched by a supervisor) keeps the relay running.
    tracing::debug!("Relay console closed");
}

/// Ask a question on the terminal; `None` on EOF or a blank answer
fn prompt(question: &str) -> Option<String> {
    print!("{question}");
    std::io::stdout().flush().ok()?;

    let mut answer = String::new();
    match std::io::stdin().read_line(&mut answer) {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let answer = answer.trim();
            (!answer.is_empty()).then(|| answer.to_string())
        }
    }
}

/// Run an interactive peer until `/quit` or end of input
async fn run_peer(config: &Config) -> anyhow::Result<()> {
    let name = match &config.peer.name {
        Some(name) => FixedName::new(name.clone()),
        None => match prompt("Your name: ") {
            Some(name) => FixedName::new(name),
            None => FixedName::fallback(),
        },
    };

    let downloads = DownloadStore::new(&config.peer.downloads_dir, config.peer.file_prefix.clone());
    let (peer, mut events) = Peer::tcp(config.peer_config(), Arc::new(name), downloads)?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Status(line) => println!("* {line}"),
                PeerEvent::Roster(names) => println!("* Online: {}", names.join(", ")),
                PeerEvent::Message { from, text } => println!("{from}: {text}"),
                PeerEvent::FileReceived { from, path } => {
                    println!("* {from} sent {}", path.display());
                }
            }
        }
    });

    println!("Commands: /to <name>, /file <path>, /who, /connect, /disconnect, /quit");
    connect_reporting(&peer);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let result = match command {
            "/quit" => break,
            "/to" => {
                peer.set_target(arg).await;
                println!("* Sending to {}", peer.target().await);
                Ok(())
            }
            "/who" => {
                println!("* Online: {}", peer.roster().await.join(", "));
                Ok(())
            }
            "/connect" => {
                connect_reporting(&peer);
                Ok(())
            }
            "/disconnect" => {
                peer.disconnect().await;
                Ok(())
            }
            "/file" => peer.send_file(Path::new(arg.trim())).await,
            _ => peer.send_text(line).await,
        };

        if let Err(e) = result {
            tracing::debug!("Command failed: {}", e);
        }
    }

    peer.disconnect().await;
    Ok(())
}

/// Connect in the background; failures are reported as status lines
fn connect_reporting(peer: &Peer) {
    let peer = peer.clone();
    tokio::spawn(async move {
        match peer.connect().await {
            Ok(()) | Err(PeerError::Exhausted { .. } | PeerError::Cancelled) => {}
            Err(e) => tracing::error!("Connect failed: {}", e),
        }
    });
}

/// Run the supervisor until Ctrl+C or SIGTERM
async fn run_supervisor(config: &Config) -> anyhow::Result<()> {
    let sup = &config.supervisor;
    let ports = resolve_ports(sup.base_port, sup.ports.as_deref(), sup.instances, || {
        prompt("How many relay instances? ").and_then(|answer| answer.parse().ok())
    })?;

    let supervisor = Supervisor::shell(config.supervisor_config(ports))?;
    let handle = supervisor.handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested");
        handle.stop();
    });

    supervisor.run().await;
    tracing::info!("Supervisor stopped");
    Ok(())
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
///
/// A signal source that cannot be installed never resolves, so the other
/// one still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
