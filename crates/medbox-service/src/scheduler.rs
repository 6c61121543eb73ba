use std::time::Duration;

use medbox_api::MedboxApi;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Run one materialize-and-sweep pass per `every` until `shutdown` flips to
/// `true`. Shutdown is only observed between passes. Returns the number of
/// passes attempted.
pub async fn run(api: MedboxApi, every: Duration, mut shutdown: watch::Receiver<bool>) -> u64 {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut passes = 0_u64;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        passes += 1;
        let pass_api = api.clone();
        match tokio::task::spawn_blocking(move || pass_api.tick()).await {
            Ok(Ok(report)) => {
                tracing::debug!(
                    pass = passes,
                    created = report.created_count,
                    updated = report.updated_count,
                    "scheduler pass finished"
                );
            }
            Ok(Err(err)) => {
                tracing::warn!(pass = passes, error = %err, "scheduler pass failed; retrying next tick");
            }
            Err(err) => {
                tracing::warn!(pass = passes, error = %err, "scheduler pass aborted");
            }
        }
    }

    tracing::info!(passes, "scheduler stopped");
    passes
}
