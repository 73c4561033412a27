//! Accept loop and per-connection protocol handling for the gateway.
//!
//! Each connection is greeted with `Ready` and then served from a read loop.
//! Every `execute` is dispatched on its own task so requests can be
//! pipelined; replies from those tasks funnel through a single writer task
//! per connection, which keeps frames whole even when responses interleave.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::Executor;

use super::protocol::{GatewayRequest, GatewayResponse};
use super::{recv_frame, send_frame};

/// The execution tier's listening side.
pub struct RpcGateway<E> {
    executor: Arc<E>,
    listener: TcpListener,
}

impl<E: Executor + 'static> RpcGateway<E> {
    /// Bind the listen address. Serving starts with [`Self::serve`].
    pub async fn bind(listen: SocketAddr, executor: Arc<E>) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind gateway listener on {listen}"))?;
        Ok(Self { executor, listener })
    }

    /// The bound address, which differs from the configured one when binding
    /// port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read gateway listen address")
    }

    /// Accept and serve connections until the listener fails.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Gateway listening");

        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;
            debug!(peer = %peer, "Web tier connected");

            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                match handle_connection(stream, executor).await {
                    Ok(()) => debug!(peer = %peer, "Web tier disconnected"),
                    Err(e) => warn!(peer = %peer, error = %e, "Connection ended with error"),
                }
            });
        }
    }
}

/// Serve one connection: greet, then answer requests until the stream ends.
async fn handle_connection<S, E>(stream: S, executor: Arc<E>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    E: Executor + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let (reply_tx, reply_rx) = mpsc::channel::<GatewayResponse>(64);
    tokio::spawn(write_replies(writer, reply_rx));

    reply_tx
        .send(GatewayResponse::Ready)
        .await
        .context("Writer gone before greeting")?;

    loop {
        let Ok(bytes) = recv_frame(&mut reader).await else {
            // EOF or a broken stream; in-flight replies are undeliverable.
            break;
        };
        let req: GatewayRequest =
            serde_json::from_slice(&bytes).context("Failed to parse request frame")?;

        match req {
            GatewayRequest::Ping => {
                if reply_tx.send(GatewayResponse::Pong).await.is_err() {
                    break;
                }
            }
            GatewayRequest::Execute { id, lang, data } => {
                debug!(request = id, lang = %lang, bytes = data.len(), "Execute received");
                let executor = Arc::clone(&executor);
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let outcome = executor.execute(&lang, &data).await;
                    // The caller may be gone; the execution still ran.
                    let _ = reply_tx
                        .send(GatewayResponse::from_outcome(id, outcome))
                        .await;
                });
            }
        }
    }

    Ok(())
}

/// Drain reply frames onto the connection until every sender is gone.
async fn write_replies<W>(mut writer: W, mut replies: mpsc::Receiver<GatewayResponse>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(resp) = replies.recv().await {
        let bytes = match serde_json::to_vec(&resp) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize reply frame");
                continue;
            }
        };
        if let Err(e) = send_frame(&mut writer, &bytes).await {
            debug!(error = %e, "Reply writer stopped");
            break;
        }
    }
}
