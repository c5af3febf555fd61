use anyhow::{anyhow, bail, Context};
use clap::Parser;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "127.0.0.1:8000";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Parser, Debug, Default)]
#[command(name = "fcc-console", about = "Live console for remote printer controllers")]
pub struct Args {
    /// tcp://host:port, host:port or unix:/path/to/socket
    #[arg(long, default_value = "")]
    pub endpoint: String,
    #[arg(long, default_value = "")]
    pub client_id: String,
    #[arg(long, default_value = "")]
    pub poll_interval_ms: String,
    /// Pause before reconnecting after a lost connection; 0 reconnects at once.
    #[arg(long, default_value = "")]
    pub reconnect_delay_ms: String,
    /// ask, accept or decline
    #[arg(long, default_value = "")]
    pub confirm: String,
    #[arg(long, default_value = "")]
    pub log_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("unix:") {
            let path = path.strip_prefix("//").unwrap_or(path);
            if path.is_empty() {
                bail!("unix endpoint needs a socket path");
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let addr = raw.strip_prefix("tcp://").unwrap_or(raw);
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("endpoint '{raw}' is missing a port"))?;
        if host.is_empty() {
            bail!("endpoint '{raw}' is missing a host");
        }
        port.parse::<u16>()
            .with_context(|| format!("endpoint '{raw}' has an invalid port"))?;
        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// How the console answers confirmation prompts from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmMode {
    #[default]
    Ask,
    Accept,
    Decline,
}

impl FromStr for ConfirmMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ask" => Ok(ConfirmMode::Ask),
            "accept" | "yes" => Ok(ConfirmMode::Accept),
            "decline" | "no" => Ok(ConfirmMode::Decline),
            other => bail!("unknown confirm mode '{other}' (expected ask, accept or decline)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub endpoint: Endpoint,
    pub client_id: String,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub confirm: ConfirmMode,
    pub log_file: Option<PathBuf>,
    pub log_stdout: bool,
    pub log_level: String,
}

pub fn load_config(args: Args) -> anyhow::Result<RuntimeConfig> {
    load_config_with(args, &|key| env::var(key).ok())
}

pub(crate) fn load_config_with(
    args: Args,
    env: &dyn Fn(&str) -> Option<String>,
) -> anyhow::Result<RuntimeConfig> {
    let endpoint = resolve_value(&args.endpoint, "FCC_ENDPOINT", env)
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
        .parse()?;
    let client_id = resolve_value(&args.client_id, "FCC_CLIENT_ID", env)
        .unwrap_or_else(|| format!("fcc-console-{}", std::process::id()));
    let poll_interval = resolve_millis(
        &args.poll_interval_ms,
        "FCC_POLL_INTERVAL_MS",
        env,
        DEFAULT_POLL_INTERVAL_MS,
    )?;
    if poll_interval.is_zero() {
        bail!("poll interval must be greater than zero");
    }
    let reconnect_delay =
        resolve_millis(&args.reconnect_delay_ms, "FCC_RECONNECT_DELAY_MS", env, 0)?;
    let confirm = match resolve_value(&args.confirm, "FCC_CONFIRM", env) {
        Some(raw) => raw.parse()?,
        None => ConfirmMode::default(),
    };
    let log_file = resolve_value(&args.log_file, "FCC_LOG_FILE", env).map(PathBuf::from);
    let log_stdout = env("FCC_LOG_STDOUT")
        .and_then(|raw| parse_bool_flag(&raw))
        .unwrap_or(false);
    let log_level = resolve_value("", "FCC_LOG_LEVEL", env).unwrap_or_else(|| "info".to_string());

    Ok(RuntimeConfig {
        endpoint,
        client_id,
        poll_interval,
        reconnect_delay,
        confirm,
        log_file,
        log_stdout,
        log_level,
    })
}

fn resolve_value(flag: &str, key: &str, env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_millis(
    flag: &str,
    key: &str,
    env: &dyn Fn(&str) -> Option<String>,
    default: u64,
) -> anyhow::Result<Duration> {
    let Some(raw) = resolve_value(flag, key, env) else {
        return Ok(Duration::from_millis(default));
    };
    let millis = raw
        .parse::<u64>()
        .with_context(|| format!("{key}: '{raw}' is not a number of milliseconds"))?;
    Ok(Duration::from_millis(millis))
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
