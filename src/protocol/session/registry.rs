use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::protocol::session::playout::PlayoutWorker;
use crate::protocol::session::session::{Session, SessionError, SessionSnapshot};
use crate::service::recording::SegmentWriter;
use crate::shared::config::EngineConfig;
use crate::shared::ports::{resolve_label, LabelLookup};

struct Inner {
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    cfg: Arc<EngineConfig>,
    labels: Arc<dyn LabelLookup>,
    shutdown: watch::Sender<bool>,
    live: watch::Sender<usize>,
}

/// Owns every live session, keyed by SSRC.
///
/// The map lock only covers lookups, inserts and removals. Opening the first
/// segment happens outside it; if two callers race on the same unseen SSRC
/// the second insert loses, throws its writer away and returns the winner.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(cfg: Arc<EngineConfig>, labels: Arc<dyn LabelLookup>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                cfg,
                labels,
                shutdown,
                live,
            }),
        }
    }

    /// Returns the live session for `ssrc`, creating it (first segment and
    /// playout worker included) when there is none. A closed session still
    /// in the map counts as absent.
    pub async fn get_or_create(
        &self,
        ssrc: u32,
        initial_seq: u16,
    ) -> Result<Arc<Session>, SessionError> {
        if let Some(existing) = self.get(ssrc).await {
            return Ok(existing);
        }
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }

        let cfg = &self.inner.cfg;
        let label = resolve_label(self.inner.labels.as_ref(), ssrc);
        let writer = match SegmentWriter::open(&cfg.recordings_dir, ssrc, &label, cfg.format) {
            Ok(writer) => writer,
            Err(e) => {
                log::error!(
                    "[registry] failed to open first segment for ssrc={} (label={}): {}",
                    ssrc,
                    label,
                    e
                );
                return Err(e.into());
            }
        };
        let session = Arc::new(Session::new(ssrc, label, initial_seq, cfg));

        {
            let mut sessions = self.inner.sessions.lock().await;
            if let Some(existing) = sessions.get(&ssrc).filter(|s| !s.is_closed()) {
                let existing = existing.clone();
                drop(sessions);
                writer.discard();
                return Ok(existing);
            }
            if let Some(old) = sessions.insert(ssrc, session.clone()) {
                log::debug!("[registry] replaced closed session for ssrc={}", old.ssrc());
            }
            self.inner.live.send_replace(sessions.len());
        }

        log::info!(
            "[registry] session created ssrc={} label={} initial_seq={}",
            ssrc,
            session.label(),
            initial_seq
        );
        let worker = PlayoutWorker::new(
            session.clone(),
            writer,
            self.clone(),
            cfg.clone(),
            self.inner.shutdown.subscribe(),
        );
        tokio::spawn(worker.run());
        Ok(session)
    }

    /// Live session for `ssrc`, if any.
    pub async fn get(&self, ssrc: u32) -> Option<Arc<Session>> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(&ssrc).filter(|s| !s.is_closed()).cloned()
    }

    /// Drops the entry for `ssrc` once its session is closed. Called by the
    /// session's own playout worker after the writer is closed; an entry that
    /// has since been replaced by a live session is left alone.
    pub async fn remove(&self, ssrc: u32) -> Option<Arc<Session>> {
        let mut sessions = self.inner.sessions.lock().await;
        let closed = sessions.get(&ssrc).is_some_and(|s| s.is_closed());
        if !closed {
            return None;
        }
        let removed = sessions.remove(&ssrc);
        self.inner.live.send_replace(sessions.len());
        if removed.is_some() {
            log::info!(
                "[registry] session removed ssrc={} (remaining={})",
                ssrc,
                sessions.len()
            );
        }
        removed
    }

    /// Calls `f` with a snapshot of every registered session. The map lock is
    /// released before any session is inspected.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionSnapshot),
    {
        let sessions: Vec<Arc<Session>> = {
            let map = self.inner.sessions.lock().await;
            map.values().cloned().collect()
        };
        for session in sessions {
            let snapshot = session.snapshot().await;
            f(&snapshot);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tells every playout worker to flush and close. New sessions are
    /// refused from here on.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            log::info!("[registry] shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Waits until no session is registered, at most `grace`. Returns whether
    /// the registry drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let mut live = self.inner.live.subscribe();
        let drained = tokio::time::timeout(grace, async {
            live.wait_for(|count| *count == 0).await.is_ok()
        })
        .await;
        matches!(drained, Ok(true))
    }

    /// SSRCs still registered; for the shutdown report.
    pub async fn ssrcs(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.inner.sessions.lock().await.keys().copied().collect();
        ssrcs.sort_unstable();
        ssrcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rtp::RtpPacket;
    use crate::protocol::session::jitter::InsertOutcome;
    use crate::shared::ports::{InMemoryLabelStore, NoopLabelLookup};
    use std::path::Path;

    fn cfg(dir: &Path) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            prefill_threshold: 4,
            max_wait: Duration::from_millis(50),
            inactivity_timeout: Duration::from_secs(2),
            recordings_dir: dir.to_path_buf(),
            ..EngineConfig::default()
        })
    }

    fn wav_files(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(wav_files(&path));
            } else if path.extension().is_some_and(|e| e == "wav") {
                out.push(path);
            }
        }
        out.sort();
        out
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creation_yields_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(cfg(dir.path()), Arc::new(NoopLabelLookup::new()));
        let (a, b) = tokio::join!(registry.get_or_create(7, 0), registry.get_or_create(7, 0));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
        assert_eq!(wav_files(dir.path()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(cfg(dir.path()), Arc::new(NoopLabelLookup::new()));
        let session = registry.get_or_create(11, 100).await.unwrap();
        for seq in 100..104u16 {
            let pkt = RtpPacket::new(96, seq, 0, 11, vec![seq as u8, 0]);
            assert_eq!(session.enqueue(pkt).await.unwrap(), InsertOutcome::Buffered);
        }

        assert!(registry.wait_idle(Duration::from_secs(10)).await);
        assert!(session.is_closed());
        assert!(registry.get(11).await.is_none());

        let files = wav_files(dir.path());
        assert_eq!(files.len(), 1);
        let samples: Vec<i16> = hound::WavReader::open(&files[0])
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples, vec![100, 101, 102, 103]);
        assert_eq!(session.snapshot().await.stats.written, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn packet_after_close_opens_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(cfg(dir.path()), Arc::new(NoopLabelLookup::new()));
        let first = registry.get_or_create(5, 0).await.unwrap();
        first.enqueue(RtpPacket::new(96, 0, 0, 5, vec![1, 0])).await.unwrap();
        assert!(registry.wait_idle(Duration::from_secs(10)).await);

        let second = registry.get_or_create(5, 1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_ignores_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(cfg(dir.path()), Arc::new(NoopLabelLookup::new()));
        registry.get_or_create(9, 0).await.unwrap();
        assert!(registry.remove(9).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_prefilling_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let labels = Arc::new(InMemoryLabelStore::new());
        labels.set(3, "desk");
        let registry = SessionRegistry::new(cfg(dir.path()), labels);
        let session = registry.get_or_create(3, 0).await.unwrap();
        assert_eq!(session.label(), "desk");
        session.enqueue(RtpPacket::new(96, 0, 0, 3, vec![9, 0])).await.unwrap();

        let mut seen = Vec::new();
        registry.for_each(|snap| seen.push((snap.ssrc, snap.buffered))).await;
        assert_eq!(seen, vec![(3, 1)]);

        registry.shutdown();
        assert!(registry.wait_idle(Duration::from_secs(1)).await);
        assert!(matches!(
            registry.get_or_create(4, 0).await,
            Err(SessionError::ShuttingDown)
        ));
        let files = wav_files(&dir.path().join("desk"));
        assert_eq!(files.len(), 1);
        assert_eq!(hound::WavReader::open(&files[0]).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_registers_nothing_and_next_call_retries() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("records");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let registry = SessionRegistry::new(cfg(&blocker), Arc::new(NoopLabelLookup::new()));

        assert!(matches!(
            registry.get_or_create(12, 0).await,
            Err(SessionError::Segment(_))
        ));
        assert_eq!(registry.len().await, 0);
        assert!(registry.get(12).await.is_none());

        std::fs::remove_file(&blocker).unwrap();
        std::fs::create_dir(&blocker).unwrap();
        let session = registry.get_or_create(12, 0).await.unwrap();
        assert_eq!(session.ssrc(), 12);
        assert_eq!(registry.len().await, 1);
        assert_eq!(wav_files(&blocker).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn racing_creations_keep_the_winner_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(EngineConfig {
            inactivity_timeout: Duration::from_secs(60),
            ..(*cfg(dir.path())).clone()
        });
        let registry = SessionRegistry::new(cfg, Arc::new(NoopLabelLookup::new()));

        let mut tasks = Vec::new();
        for ssrc in 0..300u32 {
            for _ in 0..4 {
                let registry = registry.clone();
                tasks.push(tokio::spawn(async move {
                    registry.get_or_create(ssrc, 0).await.unwrap()
                }));
            }
        }
        let mut sessions = std::collections::HashMap::new();
        for task in tasks {
            let session = task.await.unwrap();
            let first = sessions.entry(session.ssrc()).or_insert_with(|| session.clone());
            assert!(Arc::ptr_eq(first, &session));
        }
        assert_eq!(registry.len().await, 300);

        for ssrc in 0..300u32 {
            let files = wav_files(&dir.path().join(ssrc.to_string()));
            assert_eq!(files.len(), 1, "ssrc {} has {:?}", ssrc, files);
        }

        registry.shutdown();
        assert!(registry.wait_idle(Duration::from_secs(10)).await);
    }
}
