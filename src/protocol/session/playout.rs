use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::protocol::session::jitter::{BufferedPacket, GapEvent};
use crate::protocol::session::registry::SessionRegistry;
use crate::protocol::session::session::Session;
use crate::service::recording::{SegmentError, SegmentWriter};
use crate::shared::config::EngineConfig;

/// Drives one session: polls its jitter buffer, writes drained audio,
/// rotates segments and closes the session on inactivity or shutdown.
/// The only owner of the session's `SegmentWriter`.
pub(crate) struct PlayoutWorker {
    session: Arc<Session>,
    writer: SegmentWriter,
    registry: SessionRegistry,
    cfg: Arc<EngineConfig>,
    shutdown: watch::Receiver<bool>,
}

impl PlayoutWorker {
    pub(crate) fn new(
        session: Arc<Session>,
        writer: SegmentWriter,
        registry: SessionRegistry,
        cfg: Arc<EngineConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            session,
            writer,
            registry,
            cfg,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let ssrc = self.session.ssrc();
        log::info!(
            "[playout {}] started (label={}, next segment {})",
            ssrc,
            self.session.label(),
            self.writer.segment_index()
        );
        let mut tick = interval(self.cfg.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut shutting_down = *self.shutdown.borrow();
            if !shutting_down {
                tokio::select! {
                    _ = tick.tick() => {}
                    changed = self.shutdown.changed() => {
                        // A dropped sender means the registry is gone.
                        shutting_down = changed.is_err() || *self.shutdown.borrow();
                    }
                }
            }

            let step = self
                .session
                .poll(Instant::now(), &self.cfg, shutting_down)
                .await;

            for gap in &step.drained.gaps {
                log_gap(ssrc, gap);
            }

            if let Err(e) = self.write_all(&step.drained.packets).await {
                log::error!(
                    "[playout {}] segment writer failed after reopen, closing session: {}",
                    ssrc,
                    e
                );
                let dropped = self.session.force_close().await;
                if dropped > 0 {
                    log::warn!("[playout {}] dropped {} buffered packets", ssrc, dropped);
                }
                break;
            }

            if step.close {
                break;
            }
        }

        if let Err(e) = self.writer.close() {
            log::error!("[playout {}] failed to close segment: {}", ssrc, e);
        }
        self.registry.remove(ssrc).await;
        log::info!(
            "[playout {}] closed after {} segment(s)",
            ssrc,
            self.writer.segment_index() + 1
        );
    }

    async fn write_all(&mut self, packets: &[BufferedPacket]) -> Result<(), SegmentError> {
        if packets.is_empty() {
            return Ok(());
        }
        let mut written = 0u64;
        let mut result = Ok(());
        for pkt in packets {
            if let Err(e) = self.write_one(pkt) {
                result = Err(e);
                break;
            }
            written += 1;
        }
        self.session.record_written(written).await;
        result
    }

    fn write_one(&mut self, pkt: &BufferedPacket) -> Result<(), SegmentError> {
        let ssrc = self.session.ssrc();
        let now = Instant::now();
        let due = self
            .writer
            .segment_elapsed(now)
            .is_some_and(|elapsed| elapsed >= self.cfg.segment_duration);
        if due {
            match self.writer.rotate() {
                Ok(path) => log::info!(
                    "[playout {}] rotated to segment {} ({})",
                    ssrc,
                    self.writer.segment_index(),
                    path.display()
                ),
                Err(e) => {
                    log::warn!("[playout {}] rotation failed: {}", ssrc, e);
                    return self.retry_after_reopen(pkt);
                }
            }
        }

        match self.writer.write(&pkt.payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(
                    "[playout {}] write failed at seq={}: {}, reopening",
                    ssrc,
                    pkt.seq,
                    e
                );
                self.retry_after_reopen(pkt)
            }
        }
    }

    fn retry_after_reopen(&mut self, pkt: &BufferedPacket) -> Result<(), SegmentError> {
        self.writer.reopen()?;
        self.writer.write(&pkt.payload)
    }
}

fn log_gap(ssrc: u32, gap: &GapEvent) {
    log::warn!(
        "[playout {}] gap: next_seq {} -> {} (skipped {}, buffered={:?})",
        ssrc,
        gap.from,
        gap.to,
        gap.to.wrapping_sub(gap.from),
        gap.buffered
    );
}
