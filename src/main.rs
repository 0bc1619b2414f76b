use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use rtp_segment_recorder::interface::run_metadata_loop;
use rtp_segment_recorder::protocol::rtp::RtpReceiver;
use rtp_segment_recorder::protocol::session::{run_diagnostics, SessionRegistry};
use rtp_segment_recorder::protocol::transport::{bind_rtp_socket, run_rtp_udp_loop};
use rtp_segment_recorder::shared::ports::{InMemoryLabelStore, LabelLookup};
use rtp_segment_recorder::shared::{config, logging};

/// Receives RTP/UDP PCM streams and records each SSRC into rotating WAV
/// segments until Ctrl-C or SIGTERM, then flushes every open session.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cfg = config::Config::from_env().context("invalid configuration")?;
    log::info!(
        "[main] starting: listen={} recordings_dir={} format={}ch/{}B/{}Hz prefill={} max_wait={:?} segment={:?} inactivity={:?}",
        cfg.listen_addr(),
        cfg.engine.recordings_dir.display(),
        cfg.engine.format.channels,
        cfg.engine.format.sample_width,
        cfg.engine.format.sample_rate,
        cfg.engine.prefill_threshold,
        cfg.engine.max_wait,
        cfg.engine.segment_duration,
        cfg.engine.inactivity_timeout
    );

    let rtp_sock = bind_rtp_socket(cfg.listen_addr(), cfg.receive_buffer_bytes)
        .with_context(|| format!("failed to bind RTP socket on {}", cfg.listen_addr()))?;

    let labels = Arc::new(InMemoryLabelStore::new());
    let lookup: Arc<dyn LabelLookup> = labels.clone();
    let registry = SessionRegistry::new(Arc::new(cfg.engine.clone()), lookup);

    // Stops the listeners; sessions get their own signal via the registry.
    let (stop_tx, stop_rx) = watch::channel(false);

    let metadata_task = match cfg.metadata_addr() {
        Some(addr) => {
            let sock = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind metadata socket on {}", addr))?;
            Some(tokio::spawn(run_metadata_loop(sock, labels, stop_rx.clone())))
        }
        None => {
            log::info!("[main] metadata listener disabled");
            None
        }
    };

    if !cfg.diagnostics_interval.is_zero() {
        tokio::spawn(run_diagnostics(
            registry.clone(),
            cfg.diagnostics_interval,
            registry.subscribe_shutdown(),
        ));
    }

    let ingest_task = tokio::spawn(run_rtp_udp_loop(
        rtp_sock,
        RtpReceiver::new(registry.clone()),
        cfg.max_datagram_bytes,
        stop_rx,
    ));

    wait_for_shutdown_signal().await;
    log::info!("[main] shutdown signal received");

    let _ = stop_tx.send(true);
    match ingest_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("[main] RTP loop failed: {}", e),
        Err(e) => log::error!("[main] RTP loop task failed: {}", e),
    }
    if let Some(task) = metadata_task {
        if let Ok(Err(e)) = task.await {
            log::warn!("[main] metadata loop failed: {}", e);
        }
    }

    registry.shutdown();
    if registry.wait_idle(cfg.shutdown_grace).await {
        log::info!("[main] all sessions closed");
    } else {
        log::warn!(
            "[main] sessions still open after {:?}: {:?}",
            cfg.shutdown_grace,
            registry.ssrcs().await
        );
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            log::warn!("[main] shutdown signal error: {:?}", err);
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => log::warn!("[main] SIGTERM handler unavailable: {:?}", err),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("[main] shutdown signal error: {:?}", err);
    }
}
