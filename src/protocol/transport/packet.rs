use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::protocol::rtp::rx::{RawRtp, RtpReceiver};

/// Binds the RTP socket with `SO_RCVBUF` raised to `recv_buffer_bytes`
/// (0 keeps the OS default). Must be called inside a tokio runtime.
pub fn bind_rtp_socket(addr: SocketAddr, recv_buffer_bytes: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if recv_buffer_bytes > 0 {
        if let Err(e) = socket.set_recv_buffer_size(recv_buffer_bytes) {
            log::warn!(
                "[packet] failed to set SO_RCVBUF={} on {}: {}",
                recv_buffer_bytes,
                addr,
                e
            );
        }
    }
    match socket.recv_buffer_size() {
        Ok(effective) => log::info!(
            "[packet] RTP socket receive buffer requested={} effective={}",
            recv_buffer_bytes,
            effective
        ),
        Err(e) => log::debug!("[packet] could not read SO_RCVBUF: {}", e),
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// RTP UDP loop: receive, hand to the rtp layer, repeat until `shutdown`
/// turns true. A packet being routed is always finished before the loop
/// checks for shutdown again.
pub async fn run_rtp_udp_loop(
    sock: UdpSocket,
    rtp_rx: RtpReceiver,
    max_datagram_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let local_addr = sock.local_addr()?;
    log::info!("[packet] RTP socket listening on {}", local_addr);

    let mut buf = vec![0u8; max_datagram_bytes.max(1)];
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            recv_res = sock.recv_from(&mut buf) => {
                let (len, src) = match recv_res {
                    Ok(res) => res,
                    Err(e) => {
                        log::warn!("[packet] RTP recv error on {}: {}", local_addr, e);
                        continue;
                    }
                };
                if len == buf.len() {
                    log::warn!(
                        "[packet] datagram from {} filled the {}-byte buffer, may be truncated",
                        src,
                        buf.len()
                    );
                }
                let raw = RawRtp {
                    src,
                    data: buf[..len].to_vec(),
                };
                rtp_rx.handle_raw(raw).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    log::info!("[packet] RTP loop on {} stopped", local_addr);
    Ok(())
}
