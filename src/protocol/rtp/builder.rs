use crate::protocol::rtp::packet::RtpPacket;

/// Serializes a packet with a plain 12-byte header (no CSRC, no extension).
pub fn build_rtp_packet(pkt: &RtpPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + pkt.payload.len());

    let b0 = (pkt.version & 0b11) << 6;
    let mut b1 = pkt.payload_type & 0b0111_1111;
    if pkt.marker {
        b1 |= 0b1000_0000;
    }

    buf.push(b0);
    buf.push(b1);
    buf.extend_from_slice(&pkt.sequence_number.to_be_bytes());
    buf.extend_from_slice(&pkt.timestamp.to_be_bytes());
    buf.extend_from_slice(&pkt.ssrc.to_be_bytes());
    buf.extend_from_slice(&pkt.payload);

    buf
}
