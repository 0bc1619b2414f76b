use thiserror::Error;

use crate::protocol::rtp::packet::RtpPacket;

/// Fixed RTP header length (V/P/X/CC, M/PT, seq, ts, ssrc).
pub const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpParseError {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    #[error("header extension runs past end of datagram")]
    ExtensionOverflow,
    #[error("invalid padding length")]
    BadPadding,
}

/// Parses one datagram. Never panics on hostile input; every length read from
/// the header is checked against the datagram size before slicing.
pub fn parse_rtp_packet(buf: &[u8]) -> Result<RtpPacket, RtpParseError> {
    if buf.len() < RTP_HEADER_LEN {
        return Err(RtpParseError::TooShort(buf.len()));
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let version = b0 >> 6;
    let padding = (b0 & 0b0010_0000) != 0;
    let extension = (b0 & 0b0001_0000) != 0;
    let csrc_count = b0 & 0b0000_1111;

    if version != 2 {
        return Err(RtpParseError::UnsupportedVersion(version));
    }

    let marker = (b1 & 0b1000_0000) != 0;
    let payload_type = b1 & 0b0111_1111;

    let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
    let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

    let mut offset = RTP_HEADER_LEN + csrc_count as usize * 4;
    if buf.len() < offset {
        return Err(RtpParseError::TooShort(buf.len()));
    }

    if extension {
        if buf.len() < offset + 4 {
            return Err(RtpParseError::ExtensionOverflow);
        }
        let ext_len_words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4 + ext_len_words * 4;
        if buf.len() < offset {
            return Err(RtpParseError::ExtensionOverflow);
        }
    }

    let mut payload_end = buf.len();
    if padding {
        if payload_end <= offset {
            return Err(RtpParseError::BadPadding);
        }
        let pad_len = buf[payload_end - 1] as usize;
        if pad_len == 0 || pad_len > payload_end - offset {
            return Err(RtpParseError::BadPadding);
        }
        payload_end -= pad_len;
    }

    Ok(RtpPacket {
        version,
        marker,
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        payload: buf[offset..payload_end].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rtp::builder::build_rtp_packet;

    #[test]
    fn parses_plain_header_and_payload() {
        let pkt = RtpPacket::new(96, 65535, u32::MAX, 42, vec![1, 2, 3, 4]);
        let parsed = parse_rtp_packet(&build_rtp_packet(&pkt)).unwrap();
        assert_eq!(parsed.sequence_number, 65535);
        assert_eq!(parsed.timestamp, u32::MAX);
        assert_eq!(parsed.ssrc, 42);
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_short_datagram() {
        assert_eq!(
            parse_rtp_packet(&[0x80, 96, 0, 1]),
            Err(RtpParseError::TooShort(4))
        );
    }

    #[test]
    fn rejects_wrong_version() {
        let mut raw = build_rtp_packet(&RtpPacket::new(96, 1, 0, 7, vec![]));
        raw[0] = 0x40;
        assert_eq!(
            parse_rtp_packet(&raw),
            Err(RtpParseError::UnsupportedVersion(1))
        );
    }

    #[test]
    fn skips_csrcs_and_extension() {
        let mut raw = vec![0x80 | 0x10 | 0x01, 96, 0x00, 0x05];
        raw.extend_from_slice(&160u32.to_be_bytes());
        raw.extend_from_slice(&9u32.to_be_bytes());
        raw.extend_from_slice(&0xdead_beefu32.to_be_bytes()); // csrc
        raw.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01]); // ext header, 1 word
        raw.extend_from_slice(&[0, 0, 0, 0]);
        raw.extend_from_slice(&[7, 7]);
        let parsed = parse_rtp_packet(&raw).unwrap();
        assert_eq!(parsed.sequence_number, 5);
        assert_eq!(parsed.payload, vec![7, 7]);
    }

    #[test]
    fn rejects_extension_longer_than_datagram() {
        let mut raw = vec![0x80 | 0x10, 96, 0x00, 0x05];
        raw.extend_from_slice(&[0; 8]);
        raw.extend_from_slice(&[0xbe, 0xde, 0x00, 0x10]);
        raw.extend_from_slice(&[0; 4]);
        assert_eq!(parse_rtp_packet(&raw), Err(RtpParseError::ExtensionOverflow));
    }

    #[test]
    fn strips_padding() {
        let mut raw = build_rtp_packet(&RtpPacket::new(96, 1, 0, 7, vec![1, 2]));
        raw[0] |= 0b0010_0000;
        raw.extend_from_slice(&[0, 0, 3]);
        assert_eq!(parse_rtp_packet(&raw).unwrap().payload, vec![1, 2]);

        let mut bad = build_rtp_packet(&RtpPacket::new(96, 1, 0, 7, vec![1]));
        bad[0] |= 0b0010_0000;
        bad.push(9);
        assert_eq!(parse_rtp_packet(&bad), Err(RtpParseError::BadPadding));
    }
}
