pub mod packet;

pub use packet::{bind_rtp_socket, run_rtp_udp_loop};
