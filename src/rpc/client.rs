//! Caller side of the gateway protocol, used by the web tier.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::protocol::{GatewayRequest, GatewayResponse};
use super::{recv_frame, send_frame};

/// One connection to the execution tier.
///
/// Requests on a client are serialized; a caller that wants concurrent
/// executions opens one client per stream of work. A connection error leaves
/// any outstanding request unresolved, so the caller resubmits on a fresh
/// connection if it still cares.
pub struct GatewayClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    next_id: u64,
}

impl GatewayClient {
    /// Connect and consume the gateway's `Ready` greeting.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to gateway at {addr}"))?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            next_id: 1,
        };

        match client.recv().await.context("Failed to read greeting")? {
            GatewayResponse::Ready => Ok(client),
            other => anyhow::bail!("Expected Ready frame, got: {other:?}"),
        }
    }

    /// Run `data` in `lang`'s interpreter and wait for the reply frame.
    pub async fn execute(&mut self, lang: &str, data: &str) -> Result<GatewayResponse> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&GatewayRequest::Execute {
            id,
            lang: lang.to_string(),
            data: data.to_string(),
        })
        .await?;

        loop {
            let resp = self.recv().await?;
            match &resp {
                GatewayResponse::Result { id: rid, .. }
                | GatewayResponse::Error { id: rid, .. } => {
                    anyhow::ensure!(*rid == id, "Reply for request {rid}, expected {id}");
                    return Ok(resp);
                }
                GatewayResponse::Ready | GatewayResponse::Pong => {
                    debug!("Ignoring out-of-band frame: {resp:?}");
                }
            }
        }
    }

    /// Health check.
    pub async fn ping(&mut self) -> Result<()> {
        self.send(&GatewayRequest::Ping).await?;
        match self.recv().await? {
            GatewayResponse::Pong => Ok(()),
            other => anyhow::bail!("Expected Pong frame, got: {other:?}"),
        }
    }

    async fn send(&mut self, req: &GatewayRequest) -> Result<()> {
        let bytes = serde_json::to_vec(req).context("Failed to serialize request")?;
        send_frame(&mut self.writer, &bytes).await
    }

    async fn recv(&mut self) -> Result<GatewayResponse> {
        let bytes = recv_frame(&mut self.reader).await?;
        serde_json::from_slice(&bytes).context("Failed to parse gateway reply")
    }
}
