//! Background age sweep

use crate::store::StoreInner;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn the periodic age sweep.
///
/// The task holds only a weak reference, so it ends on its own once the
/// last store handle is dropped.
pub(crate) fn spawn_age_sweep(inner: Weak<StoreInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(store) = inner.upgrade() else {
                tracing::debug!("Cache dropped, stopping age sweep");
                break;
            };
            match tokio::task::spawn_blocking(move || store.cleanup_expired()).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Removed expired cache entries"),
                Err(e) => tracing::warn!(error = %e, "Cache age sweep failed"),
            }
        }
    })
}
