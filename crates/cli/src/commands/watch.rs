//! Interactive session.
//!
//! Reads commands from stdin, one per line:
//!
//! - `add <product> [qty]`
//! - `remove <product>`
//! - `show`
//! - `quit`
//!
//! Every line counts as user activity. The background scheduler syncs as it
//! would in a browser tab. Ctrl+C, SIGTERM, `quit` or end of input is the
//! page teardown: pending changes are flushed as a beacon before exit.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use cart_sync_client::{Activity, CartClient, HttpCartApi, LifecycleEvent};

use super::cart;

/// Time given to a queued beacon before the runtime shuts down.
const BEACON_GRACE: Duration = Duration::from_millis(500);

/// Run the session until teardown.
///
/// # Errors
///
/// Returns an error if stdin cannot be read.
pub async fn run(client: &CartClient<HttpCartApi>) -> std::io::Result<()> {
    info!(tab_id = %client.tab_id(), "Session started; type `quit` to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            () = &mut shutdown => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        client.activity().record(Activity::KeyDown);
        if !handle_line(client, line.trim()) {
            break;
        }
    }

    client.lifecycle().emit(LifecycleEvent::PageHide);
    tokio::time::sleep(BEACON_GRACE).await;
    info!("Session ended");
    Ok(())
}

/// Apply one input line. Returns `false` to end the session.
fn handle_line(client: &CartClient<HttpCartApi>, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next(), words.next()) {
        (None, _, _) => Ok(()),
        (Some("quit" | "exit"), _, _) => return false,
        (Some("show"), None, _) => {
            cart::show(client);
            Ok(())
        }
        (Some("add"), Some(product), qty) => match qty.map_or(Ok(1), str::parse::<i64>) {
            Ok(qty) => cart::add(client, product, qty).map_err(|e| e.to_string()),
            Err(e) => Err(format!("invalid quantity: {e}")),
        },
        (Some("remove"), Some(product), None) => {
            cart::remove(client, product).map_err(|e| e.to_string())
        }
        _ => Err(format!("unrecognized command: {line}")),
    };

    if let Err(message) = result {
        warn!("{message}");
    }
    true
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, flushing cart");
}
