use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::shared::ports::InMemoryLabelStore;

const MAX_METADATA_DATAGRAM: usize = 4096;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid metadata json: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// One side-channel update: names the stream `ssrc` for future sessions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataMessage {
    pub ssrc: u32,
    #[serde(default)]
    pub label: Option<String>,
}

impl MetadataMessage {
    pub fn parse(data: &[u8]) -> Result<Self, MetadataError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Applies the update; an empty or missing label clears the mapping.
    pub fn apply(self, store: &InMemoryLabelStore) {
        match self.label.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) {
            Some(label) => {
                log::info!("[metadata] ssrc={} label={}", self.ssrc, label);
                store.set(self.ssrc, label);
            }
            None => {
                if store.remove(self.ssrc).is_some() {
                    log::info!("[metadata] ssrc={} label cleared", self.ssrc);
                }
            }
        }
    }
}

pub async fn run_metadata_loop(
    sock: UdpSocket,
    store: Arc<InMemoryLabelStore>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let local_addr = sock.local_addr()?;
    log::info!("[metadata] listening on {}", local_addr);
    let mut buf = vec![0u8; MAX_METADATA_DATAGRAM];
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            recv_res = sock.recv_from(&mut buf) => {
                let (len, src) = match recv_res {
                    Ok(res) => res,
                    Err(e) => {
                        log::warn!("[metadata] recv error: {}", e);
                        continue;
                    }
                };
                match MetadataMessage::parse(&buf[..len]) {
                    Ok(msg) => msg.apply(&store),
                    Err(e) => log::warn!("[metadata] ignored datagram from {}: {}", src, e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    log::info!("[metadata] stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ports::LabelLookup;

    #[test]
    fn parses_label_update() {
        let msg = MetadataMessage::parse(br#"{"ssrc": 42, "label": "booth-1"}"#).unwrap();
        assert_eq!(
            msg,
            MetadataMessage {
                ssrc: 42,
                label: Some("booth-1".to_string())
            }
        );
    }

    #[test]
    fn rejects_bad_json_and_out_of_range_ssrc() {
        assert!(MetadataMessage::parse(b"not json").is_err());
        assert!(MetadataMessage::parse(br#"{"ssrc": 4294967296}"#).is_err());
        assert!(MetadataMessage::parse(br#"{"label": "x"}"#).is_err());
    }

    #[test]
    fn empty_or_missing_label_clears_mapping() {
        let store = InMemoryLabelStore::new();
        MetadataMessage::parse(br#"{"ssrc": 1, "label": "a"}"#)
            .unwrap()
            .apply(&store);
        MetadataMessage::parse(br#"{"ssrc": 2, "label": "b"}"#)
            .unwrap()
            .apply(&store);
        assert_eq!(store.label_for(1).as_deref(), Some("a"));

        MetadataMessage::parse(br#"{"ssrc": 1, "label": "  "}"#)
            .unwrap()
            .apply(&store);
        MetadataMessage::parse(br#"{"ssrc": 2}"#).unwrap().apply(&store);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn loop_applies_datagrams_until_shutdown() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let store = Arc::new(InMemoryLabelStore::new());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_metadata_loop(sock, store.clone(), rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"garbage", addr).await.unwrap();
        client
            .send_to(br#"{"ssrc": 77, "label": "lobby"}"#, addr)
            .await
            .unwrap();
        for _ in 0..100 {
            if store.label_for(77).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.label_for(77).as_deref(), Some("lobby"));

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
