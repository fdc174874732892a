//! Connectivity waiter: polls an external predicate until the network is
//! reachable or any stop signal fires.

use std::time::Duration;

use slog_scope::info;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// External network-reachability probe.
pub trait ConnectivityChecker: Send + Sync {
    fn has_connectivity(&self) -> bool;
}

/// Wait until `checker` reports connectivity (true) or any stop token
/// fires (false). No checker means waiting is disabled and the result is
/// true. The checker is polled once a second; a stop racing a positive
/// probe may win.
pub async fn wait_for_connectivity(
    checker: Option<&dyn ConnectivityChecker>,
    stop_broadcasts: &[CancellationToken],
) -> bool {
    let Some(checker) = checker else { return true };
    if checker.has_connectivity() {
        return true;
    }

    info!("waiting_for_network_connectivity");

    // Fan the variable stop set into one channel. The forwarders die with
    // this scope through the drop guard.
    let scope = CancellationToken::new();
    let _scope_guard = scope.clone().drop_guard();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    for stop in stop_broadcasts {
        let stop = stop.clone();
        let scope = scope.clone();
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = stop_tx.try_send(());
                }
                _ = scope.cancelled() => {}
            }
        });
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    // The immediate first tick; the predicate was just checked.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if checker.has_connectivity() {
                    return true;
                }
            }
            _ = stop_rx.recv() => return false,
        }
    }
}
