pub mod builder;
pub mod packet;
pub mod parser;
pub mod rx;
pub mod seq;

pub use builder::build_rtp_packet;
pub use packet::RtpPacket;
pub use parser::{parse_rtp_packet, RtpParseError};
pub use rx::{RawRtp, RtpReceiver};
