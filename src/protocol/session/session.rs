use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::protocol::rtp::RtpPacket;
use crate::protocol::session::jitter::{Drained, InsertOutcome, JitterBuffer};
use crate::service::recording::SegmentError;
use crate::shared::config::EngineConfig;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("segment writer: {0}")]
    Segment(#[from] SegmentError),
    #[error("payload of {len} bytes is not a multiple of the {frame}-byte frame")]
    MisalignedPayload { len: usize, frame: usize },
    #[error("session already closed")]
    Closed(RtpPacket),
    #[error("registry is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Prefilling,
    Draining,
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Prefilling => "prefilling",
            SessionPhase::Draining => "draining",
            SessionPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub received: u64,
    pub duplicates: u64,
    pub late: u64,
    pub misaligned: u64,
    pub gaps: u64,
    pub written: u64,
}

/// Read-only view for diagnostics.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub ssrc: u32,
    pub label: String,
    pub phase: SessionPhase,
    pub buffered: usize,
    pub next_seq: u16,
    pub stats: SessionStats,
}

/// What the playout worker should do after one poll.
#[derive(Debug, Default)]
pub struct PollStep {
    pub drained: Drained,
    pub close: bool,
}

struct SessionState {
    buffer: JitterBuffer,
    last_activity: Instant,
    phase: SessionPhase,
    stats: SessionStats,
}

/// One producer's stream. Shared between the ingestion loop (enqueue) and its
/// playout worker (poll); both go through the same short-lived lock and
/// neither does I/O while holding it.
pub struct Session {
    ssrc: u32,
    label: String,
    frame_size: usize,
    closed: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(ssrc: u32, label: String, initial_seq: u16, cfg: &EngineConfig) -> Self {
        Self {
            ssrc,
            label,
            frame_size: cfg.format.frame_size(),
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                buffer: JitterBuffer::new(initial_seq, cfg.prefill_threshold, cfg.max_wait),
                last_activity: Instant::now(),
                phase: SessionPhase::Prefilling,
                stats: SessionStats::default(),
            }),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffers one packet. Duplicates and late packets are dropped (logged,
    /// `Ok` with the outcome); a closed session hands the packet back so the
    /// caller can route it to a fresh session.
    pub async fn enqueue(&self, packet: RtpPacket) -> Result<InsertOutcome, SessionError> {
        let len = packet.payload.len();
        let mut state = self.state.lock().await;
        if state.phase == SessionPhase::Closed {
            return Err(SessionError::Closed(packet));
        }
        if len % self.frame_size != 0 {
            state.stats.misaligned += 1;
            return Err(SessionError::MisalignedPayload {
                len,
                frame: self.frame_size,
            });
        }

        let seq = packet.sequence_number;
        let outcome = state.buffer.insert(seq, packet.timestamp, packet.payload);
        match outcome {
            InsertOutcome::Buffered => {
                state.stats.received += 1;
                state.last_activity = Instant::now();
            }
            InsertOutcome::Duplicate => {
                state.stats.duplicates += 1;
                log::warn!(
                    "[session {}] duplicate seq={} dropped (total duplicates={})",
                    self.ssrc,
                    seq,
                    state.stats.duplicates
                );
            }
            InsertOutcome::Late => {
                state.stats.late += 1;
                log::warn!(
                    "[session {}] late seq={} dropped (next_seq={}, total late={})",
                    self.ssrc,
                    seq,
                    state.buffer.next_seq(),
                    state.stats.late
                );
            }
        }
        Ok(outcome)
    }

    /// One playout step under the session lock. Returns payloads ready for
    /// the writer and whether the session must close now.
    pub(crate) async fn poll(&self, now: Instant, cfg: &EngineConfig, shutting_down: bool) -> PollStep {
        let mut state = self.state.lock().await;
        let mut step = PollStep::default();
        if state.phase == SessionPhase::Closed {
            step.close = true;
            return step;
        }

        if state.phase == SessionPhase::Prefilling && state.buffer.check_prefill() {
            state.phase = SessionPhase::Draining;
            log::info!(
                "[session {}] prefill complete with {} packets, next_seq={}",
                self.ssrc,
                state.buffer.len(),
                state.buffer.next_seq()
            );
        }

        if state.phase == SessionPhase::Draining {
            step.drained = state.buffer.drain(now);
            if !step.drained.is_empty() {
                state.last_activity = now;
            }
        }

        let idle = now.saturating_duration_since(state.last_activity) > cfg.inactivity_timeout;
        if idle || shutting_down {
            let rest = state.buffer.flush();
            if !rest.packets.is_empty() {
                log::info!(
                    "[session {}] flushing {} buffered packets before close",
                    self.ssrc,
                    rest.packets.len()
                );
            }
            step.drained.packets.extend(rest.packets);
            step.drained.gaps.extend(rest.gaps);
            step.close = true;
            state.phase = SessionPhase::Closed;
            self.closed.store(true, Ordering::Release);
        }

        state.stats.gaps += step.drained.gaps.len() as u64;
        step
    }

    /// Marks the session closed without draining; used when the writer
    /// failed for good. Whatever is still buffered is dropped.
    pub(crate) async fn force_close(&self) -> usize {
        let mut state = self.state.lock().await;
        state.phase = SessionPhase::Closed;
        self.closed.store(true, Ordering::Release);
        state.buffer.flush().packets.len()
    }

    pub(crate) async fn record_written(&self, packets: u64) {
        let mut state = self.state.lock().await;
        state.stats.written += packets;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            ssrc: self.ssrc,
            label: self.label.clone(),
            phase: state.phase,
            buffered: state.buffer.len(),
            next_seq: state.buffer.next_seq(),
            stats: state.stats,
        }
    }
}
