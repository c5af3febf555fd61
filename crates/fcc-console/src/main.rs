mod app;
mod commands;
mod config;
mod link;
mod logging;

use crate::app::{Console, STATUS_INTERVAL};
use crate::config::{load_config, Args};
use crate::link::LinkConfig;
use crate::logging::init_logging;
use clap::Parser;
use fcc_sync::{PayloadSandbox, Session, SessionConfig};
use std::io::{self, BufRead};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args)?;
    let _log_guard = init_logging(&config);
    info!(
        event = "console_start",
        endpoint = %config.endpoint,
        client_id = %config.client_id,
        poll_ms = config.poll_interval.as_millis() as u64
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link_config = LinkConfig {
        endpoint: config.endpoint.clone(),
        client_id: config.client_id.clone(),
        reconnect_delay: config.reconnect_delay,
    };
    let link_task = tokio::spawn(link::run(link_config, event_tx, shutdown_rx));

    let (line_tx, line_rx) = mpsc::channel::<String>(64);
    spawn_stdin_reader(line_tx);

    let session = Session::new(
        SessionConfig {
            poll_interval: config.poll_interval,
        },
        Box::<PayloadSandbox>::default(),
    );
    let console = Console::new(session, config.confirm, io::stdout());
    let console = app::run(console, event_rx, line_rx, STATUS_INTERVAL).await;

    let _ = shutdown_tx.send(true);
    if let Err(err) = link_task.await {
        warn!(event = "link_task_failed", error = %err);
    }
    info!(
        event = "console_stop",
        link = console.session().state().as_str(),
        pending = console.session().pending_calls()
    );
    Ok(())
}

/// Stdin is read on a plain thread so a pending read never holds up
/// runtime shutdown.
fn spawn_stdin_reader(tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
}
