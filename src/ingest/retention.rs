use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::logging::{error, info, obj, v_int, v_str, Domain};
use crate::store::Store;

/// Deletes rounds and forecasts created before `now - horizon`.
/// The cache is left to age out on its own.
pub fn sweep_once(store: &Store, horizon: chrono::Duration) -> Result<(usize, usize)> {
    let cutoff = Utc::now() - horizon;
    let (rounds, forecasts) = store.delete_older_than(cutoff)?;
    info(
        Domain::Store,
        "retention_sweep",
        obj(&[
            ("cutoff", v_str(&cutoff.to_rfc3339())),
            ("rounds", v_int(rounds as i64)),
            ("forecasts", v_int(forecasts as i64)),
        ]),
    );
    Ok((rounds, forecasts))
}

pub async fn run(
    store: Arc<Store>,
    horizon: chrono::Duration,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    info(Domain::Store, "retention_stopped", obj(&[]));
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = sweep_once(&store, horizon) {
                    error(Domain::Store, "retention_failed", obj(&[("error", v_str(&format!("{:#}", err)))]));
                }
            }
        }
    }
}
