//! Bus configuration.
//!
//! Settings come from an optional JSON file, then environment overrides:
//!
//! | Variable                    | Field            |
//! |-----------------------------|------------------|
//! | `PACKET_BUS_HOST`           | `host`           |
//! | `PACKET_BUS_PORT`           | `port`           |
//! | `PACKET_BUS_ACK`            | `ack_enabled`    |
//! | `PACKET_BUS_ECHO_BROADCAST` | `echo_broadcast` |
//!
//! Unparseable override values are ignored with a warning.

use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKLOG, DEFAULT_HOST, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT,
    DEFAULT_REASSEMBLY_TIMEOUT,
};

/// Configuration shared by the bus relay and its endpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    /// Address the relay listens on and endpoints connect to.
    pub host: Ipv4Addr,
    /// TCP port of the relay.
    pub port: u16,
    /// Listen backlog of the relay socket.
    pub backlog: i32,
    /// Milliseconds a partial message may wait for missing packets.
    pub reassembly_timeout_ms: u64,
    /// Largest payload an endpoint will send.
    pub max_message_size: usize,
    /// Reply `ACK` / `NACK` to unicast messages.
    pub ack_enabled: bool,
    /// Relay broadcasts back to their sender too.
    pub echo_broadcast: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST,
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            reassembly_timeout_ms: DEFAULT_REASSEMBLY_TIMEOUT.as_millis() as u64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ack_enabled: false,
            echo_broadcast: true,
        }
    }
}

impl BusConfig {
    /// Load from `path` (if given), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parse config file: {}", path.display()))
    }

    /// Apply `PACKET_BUS_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("PACKET_BUS_HOST") {
            match host.parse() {
                Ok(host) => self.host = host,
                Err(_) => log::warn!("[config] ignoring PACKET_BUS_HOST={host:?}"),
            }
        }

        if let Some(port) = lookup("PACKET_BUS_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("[config] ignoring PACKET_BUS_PORT={port:?}"),
            }
        }

        if let Some(ack) = lookup("PACKET_BUS_ACK") {
            match parse_flag(&ack) {
                Some(ack) => self.ack_enabled = ack,
                None => log::warn!("[config] ignoring PACKET_BUS_ACK={ack:?}"),
            }
        }

        if let Some(echo) = lookup("PACKET_BUS_ECHO_BROADCAST") {
            match parse_flag(&echo) {
                Some(echo) => self.echo_broadcast = echo,
                None => log::warn!("[config] ignoring PACKET_BUS_ECHO_BROADCAST={echo:?}"),
            }
        }
    }

    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be non-zero");
        }
        if self.backlog <= 0 {
            bail!("backlog must be positive, got {}", self.backlog);
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be positive");
        }
        Ok(())
    }

    /// Relay address.
    pub fn server_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }

    /// Reassembly timeout as a `Duration`.
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
