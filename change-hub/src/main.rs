use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use change_hub::envelope::ChangeEnvelope;
use change_hub::hub::ChangeHub;
use change_hub::server::ChangeServer;
use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "tcp:7171";

/// Command-line interface definition for change-hub.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "change-hub",
    version,
    about = "Serves a captured change log to realtime-sync clients.",
    long_about = None
)]
struct Cli {
    /// Path to a JSONL file of change envelopes to replay.
    #[arg(long = "replay", value_name = "PATH")]
    replay: PathBuf,

    /// Listener binding. Accepts tcp:<port> or <host>:<port>.
    #[arg(long, value_name = "ENDPOINT", default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Delay in milliseconds between replayed changes.
    #[arg(
        long = "interval-ms",
        default_value_t = 25,
        value_parser = clap::value_parser!(u64).range(0..=60_000)
    )]
    interval_ms: u64,

    /// Tracing filter (info,warn,debug,trace). Can also be provided via CHANGE_HUB_LOG.
    #[arg(
        long = "log-level",
        value_name = "FILTER",
        default_value = "info",
        env = "CHANGE_HUB_LOG"
    )]
    log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenAddress(SocketAddr);

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{}", self.0)
    }
}

impl FromStr for ListenAddress {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(port) = value.strip_prefix("tcp:") {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("tcp listener must specify a numeric port"))?;
            return Ok(ListenAddress(SocketAddr::from(([127, 0, 0, 1], port))));
        }
        let addr: SocketAddr = value
            .parse()
            .map_err(|_| anyhow!("listen endpoint must be tcp:<port> or <host>:<port>"))?;
        Ok(ListenAddress(addr))
    }
}

fn init_tracing(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to init tracing subscriber: {err}"))
}

fn load_change_log(path: &Path) -> Result<Vec<ChangeEnvelope>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read change log {}", path.display()))?;
    let mut envelopes = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match ChangeEnvelope::from_line(line) {
            Ok(envelope) => envelopes.push(envelope),
            Err(err) => {
                tracing::warn!(line = lineno + 1, error = %err, "skipping malformed change log line");
            }
        }
    }
    if envelopes.is_empty() {
        bail!("change log {} contains no usable envelopes", path.display());
    }
    Ok(envelopes)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let listen = ListenAddress::from_str(cli.listen.trim())?;
    let envelopes = load_change_log(&cli.replay)?;

    let hub = ChangeHub::new();
    let server = ChangeServer::bind(listen.0, hub.clone()).await?;
    tracing::info!(
        listen = %ListenAddress(server.local_addr()),
        changes = envelopes.len(),
        interval_ms = cli.interval_ms,
        "change-hub starting replay"
    );

    let interval = Duration::from_millis(cli.interval_ms);
    let mut delivered = 0usize;
    for envelope in &envelopes {
        delivered += hub.publish(envelope);
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    tracing::info!(
        changes = envelopes.len(),
        deliveries = delivered,
        "replay complete; serving until interrupted"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    drop(server);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_tcp_listener() {
        let listen = ListenAddress::from_str("tcp:6000").unwrap();
        assert_eq!(listen.0.port(), 6000);
        let listen = ListenAddress::from_str("0.0.0.0:7000").unwrap();
        assert_eq!(listen.0.port(), 7000);
        assert!(ListenAddress::from_str("unix:/tmp/x").is_err());
    }

    #[test]
    fn loads_change_log_skipping_bad_lines() {
        let mut file = NamedTempFile::new().unwrap();
        let good = ChangeEnvelope::insert("messages", serde_json::json!({"id": "m1"}))
            .to_line()
            .unwrap();
        writeln!(file, "{good}").unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();

        let envelopes = load_change_log(file.path()).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].table, "messages");
    }

    #[test]
    fn empty_change_log_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "garbage").unwrap();
        assert!(load_change_log(file.path()).is_err());
    }
}
