use std::time::Duration;

use tokio::sync::watch;

use crate::protocol::session::registry::SessionRegistry;

/// Periodically logs one line per live session until shutdown fires.
pub async fn run_diagnostics(
    registry: SessionRegistry,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    // The first tick fires immediately; skip it so the report starts one
    // period in.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let mut count = 0usize;
        registry
            .for_each(|snap| {
                count += 1;
                log::info!(
                    "[diag] ssrc={} label={} state={} buffered={} next_seq={} received={} duplicates={} late={} gaps={} written={}",
                    snap.ssrc,
                    snap.label,
                    snap.phase,
                    snap.buffered,
                    snap.next_seq,
                    snap.stats.received,
                    snap.stats.duplicates,
                    snap.stats.late,
                    snap.stats.gaps,
                    snap.stats.written
                );
            })
            .await;
        log::debug!("[diag] {} active session(s)", count);
    }
    log::debug!("[diag] stopped");
}
