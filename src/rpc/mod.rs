//! RPC boundary between the web tier and the execution tier.
//!
//! Length-prefixed JSON frames over a connection-oriented byte stream. The
//! server greets each connection with `Ready`, the client sends `execute` and
//! `ping` requests, and every reply echoes the request's `id` so pipelined
//! requests can be told apart.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::GatewayClient;
pub use protocol::{ErrorKind, GatewayRequest, GatewayResponse};
pub use server::RpcGateway;

use anyhow::Result;

/// Maximum frame size (64 MB). Safety valve against malformed frames.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Write a length-prefixed frame to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Frame too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_FRAME_SIZE,
        "Frame exceeds max size: {len} > {MAX_FRAME_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_FRAME_SIZE`.
pub async fn recv_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_FRAME_SIZE,
        "Frame exceeds max size: {len} > {MAX_FRAME_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_framing() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        send_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_frame(&mut cursor).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn empty_payload() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_frame(&mut cursor).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn frame_split_across_reads_is_reassembled() {
        let payload = br#"{"type":"ping"}"#;
        let mut framed = Vec::new();
        framed.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        framed.extend_from_slice(payload);

        // Length prefix and payload arrive in three separate reads.
        let mut reader = tokio_test::io::Builder::new()
            .read(&framed[..3])
            .read(&framed[3..8])
            .read(&framed[8..])
            .build();

        let received = recv_frame(&mut reader).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut framed = Vec::new();
        framed.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());

        let mut cursor = std::io::Cursor::new(framed);
        let err = recv_frame(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("max size"));
    }

    #[tokio::test]
    async fn protocol_serialize_request() {
        let req = GatewayRequest::Execute {
            id: 1,
            lang: "python".to_string(),
            data: "print(42)".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"execute\""));
        assert!(json.contains("\"lang\":\"python\""));
    }

    #[tokio::test]
    async fn protocol_serialize_response() {
        let resp = GatewayResponse::Result {
            id: 1,
            stdout: "42\n".to_string(),
            stderr: String::new(),
            exited_during_execution: false,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"type\":\"result\""));
        assert!(json.contains("\"exited_during_execution\":false"));
    }

    #[tokio::test]
    async fn protocol_deserialize_ready() {
        let json = r#"{"type":"ready"}"#;
        let resp: GatewayResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(resp, GatewayResponse::Ready));
    }
}
