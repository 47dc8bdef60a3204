//! packet-bus CLI - run the relay or an interactive endpoint.
//!
//! ```text
//! packet-bus bus  [--config bus.json]
//! packet-bus node --id 5 [--config bus.json]
//! ```
//!
//! A node reads lines from stdin: `8:hello` sends `hello` to id 8,
//! `*:hello` broadcasts it. Delivered messages are printed to stdout.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use packet_bus::{BusConfig, BusManager, Communication, OsSocket};

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// How often the node loop checks for shutdown while stdin is idle.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "packet-bus")]
#[command(version)]
#[command(about = "Packet-framed TCP bus relay and endpoint")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until SIGINT/SIGTERM
    Bus {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Connect an endpoint and exchange messages over stdin/stdout
    Node {
        /// Bus id of this endpoint
        #[arg(long)]
        id: u32,
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

fn run_bus(config: &BusConfig) -> Result<()> {
    register_signals()?;

    let bus = BusManager::instance(config);
    bus.start()
        .with_context(|| format!("start relay on {}", config.server_addr()))?;
    println!("Relay listening on {}", config.server_addr());

    bus.run_until(&SHUTDOWN_FLAG).context("stop relay")?;
    BusManager::release_instance();
    println!("Relay stopped.");
    Ok(())
}

/// Parse `dest:text` (unicast) or `*:text` (broadcast).
fn parse_line(line: &str) -> Option<(Option<u32>, &str)> {
    let (target, text) = line.split_once(':')?;
    match target.trim() {
        "*" => Some((None, text)),
        id => id.parse().ok().map(|id| (Some(id), text)),
    }
}

fn run_node(config: &BusConfig, id: u32) -> Result<()> {
    register_signals()?;

    let node = Communication::new(
        config,
        Arc::new(OsSocket::new()),
        id,
        Arc::new(|src, data| {
            println!("[{src}] {}", String::from_utf8_lossy(&data));
        }),
    );
    node.set_ack_callback(Arc::new(|src, status| {
        println!("[{src}] {status}");
    }));
    node.start_connection()
        .with_context(|| format!("connect to relay at {}", config.server_addr()))?;
    println!("Connected as {id}. Type `dest:text` or `*:text`.");

    // stdin blocks, so read it on its own thread and poll the channel.
    let (tx, rx) = mpsc::channel::<String>();
    std::thread::Builder::new()
        .name("stdin-reader".to_owned())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn stdin reader")?;

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        let line = match rx.recv_timeout(INPUT_POLL_INTERVAL) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if !node.is_connected() {
                    println!("Relay closed the connection.");
                    break;
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some((dest, text)) = parse_line(&line) else {
            eprintln!("expected `dest:text` or `*:text`");
            continue;
        };
        let result = match dest {
            Some(dest) => node.send_message(text.as_bytes(), dest, false),
            None => node.send_message(text.as_bytes(), 0, true),
        };
        if let Err(e) = result {
            eprintln!("send failed: {e}");
        }
    }

    println!("Shutting down...");
    node.close_connection().context("close connection")?;
    Ok(())
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("PACKET_BUS_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Bus { config } => {
            let config = BusConfig::load(config.as_deref())?;
            run_bus(&config)?;
        }
        Commands::Node { id, config } => {
            let config = BusConfig::load(config.as_deref())?;
            run_node(&config, id)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unicast_line() {
        assert_eq!(parse_line("8:hello"), Some((Some(8), "hello")));
        assert_eq!(parse_line(" 12 :a:b"), Some((Some(12), "a:b")));
    }

    #[test]
    fn test_parse_broadcast_line() {
        assert_eq!(parse_line("*:everyone"), Some((None, "everyone")));
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert_eq!(parse_line("no separator"), None);
        assert_eq!(parse_line("x:text"), None);
    }

    #[test]
    fn test_cli_parses_node_command() {
        let cli = Cli::parse_from(["packet-bus", "node", "--id", "5"]);
        match cli.command {
            Commands::Node { id, config } => {
                assert_eq!(id, 5);
                assert!(config.is_none());
            }
            Commands::Bus { .. } => panic!("expected node command"),
        }
    }
}
