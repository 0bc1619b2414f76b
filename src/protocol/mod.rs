pub mod rtp;
pub mod session;
pub mod transport;
