//! Active-side (client) orchestration: handshake, one write-notify cycle
//! per payload, reply wait, teardown.

use std::time::Duration;

use serde::Deserialize;

use crate::completion::WrTag;
use crate::error::{RdmaError, Result};
use crate::handshake::{self, HandshakeConfig};
use crate::memory::{AccessRights, ProtectionDomain};
use crate::wire;
use crate::write_notify;

/// Client configuration. The canonical defaults match the server's.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Peer host name or address.
    pub server_addr: String,
    /// Peer port.
    pub port: u16,
    /// Capacity of the registered payload buffer, in u32 elements
    /// (including the length-prefix element).
    pub buf_elements: usize,
    /// Name/route resolution bound, milliseconds.
    pub resolve_timeout_ms: u64,
    /// Per-completion wait bound, milliseconds.
    pub notify_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            port: 9191,
            buf_elements: 512,
            resolve_timeout_ms: 500,
            notify_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    fn handshake(&self) -> HandshakeConfig {
        HandshakeConfig {
            resolve_timeout: Duration::from_millis(self.resolve_timeout_ms),
            handshake_timeout: Duration::from_millis(self.notify_timeout_ms),
        }
    }
}

/// Pushes `elements` to the server with one write-notify cycle and returns
/// the element count the server acknowledged in its reply.
pub async fn run_client(cfg: &ClientConfig, elements: &[u32]) -> Result<u32> {
    let notify_timeout = Duration::from_millis(cfg.notify_timeout_ms);
    let pd = ProtectionDomain::new();

    let (mut conn, remote) =
        handshake::connect_active(&cfg.server_addr, cfg.port, pd.clone(), &cfg.handshake()).await?;

    let capacity = cfg.buf_elements * 4;
    let packed = wire::pack_payload(elements, capacity)?;
    let payload_len = packed.len();
    let mut buffer = vec![0u8; capacity];
    buffer[..payload_len].copy_from_slice(&packed);
    let payload_mr = pd.register(buffer, AccessRights::LocalWrite)?;

    // Reply receive goes up before the write so the server's answer cannot
    // race an unposted receive.
    let reply_mr = pd.register(vec![0u8; 4], AccessRights::LocalWrite)?;
    conn.qp().post_recv(WrTag::ExpectReceive.wr_id(), &reply_mr)?;

    write_notify::push_and_notify(&mut conn, &payload_mr, payload_len, &remote, notify_timeout)
        .await?;

    // The server's reply send lands in the receive posted above.
    let wc = conn.cq_mut().wait_one(notify_timeout).await?;
    if WrTag::from_wr_id(wc.wr_id) != Some(WrTag::ExpectReceive) {
        return Err(RdmaError::UnexpectedCompletion {
            expected: WrTag::ExpectReceive,
            actual: wc.wr_id,
        });
    }
    conn.cq_mut().ack_events(1);
    let reply = reply_mr.snapshot();
    let acked_elements = u32::from_be_bytes(reply[..4].try_into().expect("reply region is 4 bytes"));
    tracing::info!(acked_elements, "server acknowledged payload");

    payload_mr.deregister().map_err(|(_, e)| e)?;
    reply_mr.deregister().map_err(|(_, e)| e)?;

    conn.disconnect()?;
    conn.wait_disconnected(notify_timeout).await?;
    conn.close()?;

    Ok(acked_elements)
}
