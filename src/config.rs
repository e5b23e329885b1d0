//! CLI flags and config-file parsing (spec.md §6 "CLI and configuration").
//!
//! Grounded on the teacher's `clap` derive usage (see `packet_inspector`'s
//! CLI in the example pack) for flags, plus a small hand-written line
//! parser for `~/.uoproxyrc` / `/etc/uoproxy.conf` — that file format (`#`
//! comments, double-quoted values, no nesting) has no ecosystem crate to
//! reach for, so it's modeled directly rather than forced into `serde`.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::error::ProxyError;

#[derive(Debug, Parser)]
#[command(name = "uoproxy", version, about = "Transparent UO protocol proxy")]
pub struct Cli {
    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all logging.
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Local port to listen on.
    #[arg(short = 'p')]
    pub port: Option<u16>,

    /// Local address to bind to, `host:port`.
    #[arg(short = 'b')]
    pub bind: Option<String>,

    /// Upstream login server, `host:port`.
    pub upstream: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub socks4: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub server_list: Vec<ServerEntry>,
    pub background: bool,
    pub autoreconnect: bool,
    pub antispy: bool,
    pub razor_workaround: bool,
    pub light: bool,
    pub client_version: Option<String>,
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:2593".parse().unwrap(),
            socks4: None,
            server: None,
            server_list: Vec::new(),
            background: false,
            autoreconnect: true,
            antispy: false,
            razor_workaround: false,
            light: false,
            client_version: None,
            verbosity: 1,
        }
    }
}

impl Config {
    /// Loads `~/.uoproxyrc` then `/etc/uoproxy.conf` (first one found
    /// wins, matching the original's lookup order), applies CLI overrides
    /// on top, and validates the result.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = Self::default();

        let user_path = user_config_path().filter(|p| p.exists());
        let etc_path = PathBuf::from("/etc/uoproxy.conf");
        if let Some(path) = user_path {
            apply_file(&mut config, &path)?;
        } else if etc_path.exists() {
            apply_file(&mut config, &etc_path)?;
        }

        if let Some(port) = cli.port {
            config.bind.set_port(port);
        }
        if let Some(bind) = &cli.bind {
            config.bind = bind
                .parse()
                .map_err(|_| ProxyError::Config(format!("invalid -b address: {bind}")))?;
        }
        if let Some(upstream) = &cli.upstream {
            config.server = Some(
                upstream
                    .parse()
                    .map_err(|_| ProxyError::Config(format!("invalid upstream address: {upstream}")))?,
            );
        }

        config.verbosity = if cli.quiet {
            0
        } else {
            config.verbosity.saturating_add(cli.verbose)
        };

        Ok(config)
    }
}

fn user_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".uoproxyrc"))
}

fn apply_file(config: &mut Config, path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .unwrap_or((line, ""));
        let value = unquote(value);

        apply_key(config, key, &value).map_err(|e| {
            ProxyError::Config(format!("{}:{}: {e}", path.display(), lineno + 1))
        })?;
    }
    Ok(())
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn parse_bool(value: &str) -> Result<bool, ProxyError> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ProxyError::Config(format!("not a boolean: {other}"))),
    }
}

fn apply_key(config: &mut Config, key: &str, value: &str) -> Result<(), ProxyError> {
    match key {
        "port" => {
            let port: u16 = value
                .parse()
                .map_err(|_| ProxyError::Config(format!("invalid port: {value}")))?;
            config.bind.set_port(port);
        }
        "bind" => {
            config.bind = value
                .parse()
                .map_err(|_| ProxyError::Config(format!("invalid bind address: {value}")))?;
        }
        "socks4" => {
            config.socks4 = Some(
                value
                    .parse()
                    .map_err(|_| ProxyError::Config(format!("invalid socks4 address: {value}")))?,
            );
        }
        "server" => {
            config.server = Some(
                value
                    .parse()
                    .map_err(|_| ProxyError::Config(format!("invalid server address: {value}")))?,
            );
        }
        "server_list" => {
            config.server_list = parse_server_list(value)?;
        }
        "background" => config.background = parse_bool(value)?,
        "autoreconnect" => config.autoreconnect = parse_bool(value)?,
        "antispy" => config.antispy = parse_bool(value)?,
        "razor_workaround" => config.razor_workaround = parse_bool(value)?,
        "light" => config.light = parse_bool(value)?,
        "client_version" => config.client_version = Some(value.to_string()),
        other => return Err(ProxyError::Config(format!("unknown config key: {other}"))),
    }
    Ok(())
}

fn parse_server_list(value: &str) -> Result<Vec<ServerEntry>, ProxyError> {
    let mut map: HashMap<String, SocketAddr> = HashMap::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, addr) = entry
            .split_once('=')
            .ok_or_else(|| ProxyError::Config(format!("invalid server_list entry: {entry}")))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| ProxyError::Config(format!("invalid server_list address: {addr}")))?;
        map.insert(name.to_string(), addr);
    }
    Ok(map
        .into_iter()
        .map(|(name, addr)| ServerEntry { name, addr })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bool_variants() {
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("yes").unwrap());
        assert!(parse_bool_err("nope"));
    }

    fn parse_bool_err(s: &str) -> bool {
        parse_bool(s).is_err()
    }

    #[test]
    fn unquotes_double_quoted_values() {
        assert_eq!(unquote("\"main\""), "main");
        assert_eq!(unquote("main"), "main");
    }

    #[test]
    fn parses_comma_separated_server_list() {
        let servers = parse_server_list("main=10.0.0.1:2593,test=10.0.0.2:2593").unwrap();
        assert_eq!(servers.len(), 2);
    }
}
