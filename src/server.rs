//! Passive-side (server) orchestration: listen, accept with a pre-posted
//! notification receive, then loop write-notify cycles until the peer
//! disconnects.

use std::time::Duration;

use serde::Deserialize;

use crate::completion::WrTag;
use crate::connection::CycleEvent;
use crate::endpoint::Endpoint;
use crate::error::{RdmaError, Result};
use crate::handshake::{self, HandshakeConfig};
use crate::memory::{AccessRights, ProtectionDomain};
use crate::wire;
use crate::write_notify;

/// Server configuration. The canonical defaults match the client's.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port. Port 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Listen backlog.
    pub backlog: usize,
    /// Capacity of the remotely writable buffer, in u32 elements
    /// (including the length-prefix element).
    pub buf_elements: usize,
    /// Bound on each handshake step, milliseconds.
    pub handshake_timeout_ms: u64,
    /// Bound on each notification wait, milliseconds. Disconnects are
    /// noticed within the same bound.
    pub notify_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9191,
            backlog: 1,
            buf_elements: 512,
            handshake_timeout_ms: 30_000,
            notify_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    fn handshake(&self) -> HandshakeConfig {
        HandshakeConfig {
            resolve_timeout: Duration::from_millis(self.handshake_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

/// Serves exactly one connection: accepts it, then runs write-notify
/// cycles until the peer disconnects. Returns each cycle's payload
/// elements in arrival order.
pub async fn serve_connection(cfg: &ServerConfig) -> Result<Vec<Vec<u32>>> {
    let endpoint = Endpoint::listen(cfg.port, cfg.backlog).await?;
    serve_on(endpoint, cfg).await
}

/// Like [`serve_connection`], but on an endpoint that is already listening.
/// Useful when the caller needs the bound port before the client starts.
pub async fn serve_on(endpoint: Endpoint, cfg: &ServerConfig) -> Result<Vec<Vec<u32>>> {
    let notify_timeout = Duration::from_millis(cfg.notify_timeout_ms);
    let pd = ProtectionDomain::new();
    let data_mr = pd.register(
        vec![0u8; cfg.buf_elements * 4],
        AccessRights::RemoteReadWrite,
    )?;

    // The first cycle's notification receive must be posted before the
    // accept goes out; afterwards the client may write at any moment.
    let mut posted = None;
    let mut conn = handshake::accept_passive(endpoint, &data_mr, pd.clone(), &cfg.handshake(), {
        let posted = &mut posted;
        |conn| {
            *posted = Some(write_notify::post_notify_receive(conn, &data_mr)?);
            Ok(())
        }
    })
    .await?;

    let mut payloads = Vec::new();
    let mut posted = posted.expect("pre-post hook ran during accept");

    loop {
        match write_notify::await_notification_or_disconnect(&mut conn, posted, notify_timeout)
            .await?
        {
            None => {
                tracing::info!(cycles = payloads.len(), "peer disconnected");
                break;
            }
            Some(()) => {
                let elements = wire::unpack_payload(&data_mr.snapshot())?;
                tracing::info!(elements = elements.len(), "payload received");

                // The next cycle's receive goes up before the reply: the
                // reply is the client's green light for its next write, so
                // a receive posted after it could lose the race.
                posted = write_notify::post_notify_receive(&conn, &data_mr)?;
                send_reply(&mut conn, &pd, elements.len() as u32, notify_timeout).await?;
                payloads.push(elements);
            }
        }
    }

    conn.close()?;
    data_mr.deregister().map_err(|(_, e)| e)?;
    Ok(payloads)
}

/// Acknowledges a consumed payload with a signaled send carrying the
/// element count.
async fn send_reply(
    conn: &mut crate::connection::Connection,
    pd: &ProtectionDomain,
    acked_elements: u32,
    timeout: Duration,
) -> Result<()> {
    let reply_mr = pd.register(
        acked_elements.to_be_bytes().to_vec(),
        AccessRights::LocalWrite,
    )?;
    conn.qp()
        .post_send(WrTag::ExpectSendCompletion.wr_id(), &reply_mr, 4, true)?;

    match conn.completion_or_disconnect(timeout).await? {
        CycleEvent::Completion(wc) if WrTag::from_wr_id(wc.wr_id) == Some(WrTag::ExpectSendCompletion) => {
            conn.cq_mut().ack_events(1);
            reply_mr.deregister().map_err(|(_, e)| e)?;
            Ok(())
        }
        CycleEvent::Completion(wc) => Err(RdmaError::UnexpectedCompletion {
            expected: WrTag::ExpectSendCompletion,
            actual: wc.wr_id,
        }),
        CycleEvent::Disconnected => Err(RdmaError::HandshakeProtocolViolation(
            "peer disconnected before the reply send completed".into(),
        )),
    }
}
