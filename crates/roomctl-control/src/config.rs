use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    /// Daily-rolling service log directory, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let raw = get("ROOMCTL_LISTEN_ADDR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = raw
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid ROOMCTL_LISTEN_ADDR: {raw}"))?;
        let log_dir = get("ROOMCTL_LOG_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Ok(Self {
            listen_addr,
            log_dir,
        })
    }
}
