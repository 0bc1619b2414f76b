use std::net::SocketAddr;

use log::{debug, error, warn};

use crate::protocol::rtp::parser::parse_rtp_packet;
use crate::protocol::rtp::RtpPacket;
use crate::protocol::session::{SessionError, SessionRegistry};

/// Datagram as handed over by the UDP loop.
#[derive(Debug, Clone)]
pub struct RawRtp {
    pub src: SocketAddr,
    pub data: Vec<u8>,
}

/// transport -> rtp -> session: parses a datagram and routes the packet to
/// the session for its SSRC. Nothing here fails the caller; every rejected
/// datagram is logged and dropped.
#[derive(Clone)]
pub struct RtpReceiver {
    registry: SessionRegistry,
}

impl RtpReceiver {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub async fn handle_raw(&self, raw: RawRtp) {
        let pkt = match parse_rtp_packet(&raw.data) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!(
                    "[rtp recv] dropped malformed datagram from {} len={}: {}",
                    raw.src,
                    raw.data.len(),
                    e
                );
                return;
            }
        };
        debug!(
            "[rtp recv] from {} ssrc={} pt={} seq={} ts={} len={}",
            raw.src,
            pkt.ssrc,
            pkt.payload_type,
            pkt.sequence_number,
            pkt.timestamp,
            pkt.payload.len()
        );
        self.route(pkt).await;
    }

    async fn route(&self, pkt: RtpPacket) {
        let ssrc = pkt.ssrc;
        let mut pkt = pkt;
        // A session can close between lookup and insert; the packet then
        // belongs to its successor. One retry is enough since a fresh
        // session cannot close before its first insert.
        for _ in 0..2 {
            let session = match self.registry.get_or_create(ssrc, pkt.sequence_number).await {
                Ok(session) => session,
                Err(SessionError::ShuttingDown) => {
                    debug!("[rtp recv] ssrc={} dropped during shutdown", ssrc);
                    return;
                }
                Err(e) => {
                    error!(
                        "[rtp recv] no session for ssrc={}, dropped seq={}: {}",
                        ssrc, pkt.sequence_number, e
                    );
                    return;
                }
            };
            match session.enqueue(pkt).await {
                Ok(_) => return,
                Err(SessionError::Closed(returned)) => pkt = returned,
                Err(e) => {
                    warn!("[rtp recv] ssrc={} packet rejected: {}", ssrc, e);
                    return;
                }
            }
        }
        warn!(
            "[rtp recv] ssrc={} seq={} dropped: session kept closing",
            ssrc, pkt.sequence_number
        );
    }
}
