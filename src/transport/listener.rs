//! TCP accept loop feeding sockets to the overlay reactor.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ListenerConfig;
use crate::error::{ProtocolError, Result};
use crate::transport::overlay::OverlayHandle;

/// A bound listener whose accept loop runs in its own task
pub struct PeerListener {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PeerListener {
    /// Bind `config.address` and start handing accepted sockets to `overlay`.
    ///
    /// Sockets accepted while `max_connections` connections are live are
    /// closed immediately.
    #[instrument(skip(config, overlay), fields(address = %config.address))]
    pub async fn bind(config: &ListenerConfig, overlay: OverlayHandle) -> Result<Self> {
        let addr: SocketAddr = config
            .address
            .parse()
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid listener address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listening for peers");

        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            TcpListenerStream::new(listener),
            overlay,
            config.max_connections,
            token.clone(),
        ));

        Ok(Self {
            local_addr,
            token,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already handed over are unaffected.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
    }
}

async fn accept_loop(
    mut incoming: TcpListenerStream,
    overlay: OverlayHandle,
    max_connections: usize,
    token: CancellationToken,
) {
    let metrics = overlay.metrics();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Accept loop canceled");
                break;
            }
            next = incoming.next() => match next {
                Some(Ok(stream)) => {
                    let active = metrics.connections_active.load(Ordering::Relaxed);
                    if active >= max_connections as u64 {
                        warn!(active, max_connections, "Connection limit reached, rejecting peer");
                        continue;
                    }
                    if overlay.accept_detached(stream).is_err() {
                        info!("Overlay stopped, closing listener");
                        break;
                    }
                }
                Some(Err(e)) => {
                    // accept errors such as EMFILE are transient
                    warn!(error = %e, "Accept failed");
                }
                None => break,
            }
        }
    }
}
