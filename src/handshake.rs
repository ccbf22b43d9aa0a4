//! Handshake protocol: drives the connect/accept sequence and exchanges
//! remote-buffer descriptors through the connection's private payload.
//!
//! The descriptor travels exactly once, from the passive side to the active
//! side, inside the accept's private payload. The active side copies it out
//! of the `ESTABLISHED` event before acknowledging; the passive side encodes
//! it in canonical byte order before transmission.

use std::time::Duration;

use bytes::Bytes;

use crate::connection::{ConnectParams, Connection};
use crate::endpoint::Endpoint;
use crate::error::{RdmaError, Result};
use crate::event::CmEventKind;
use crate::memory::{MemoryRegion, ProtectionDomain};
use crate::wire::RemoteBufferDescriptor;

/// Timing and identity knobs for one handshake. The values are
/// configuration, not protocol; the defaults are the canonical set.
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Bound on name/route resolution.
    pub resolve_timeout: Duration,
    /// Bound on each connection-management step after resolution.
    pub handshake_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Active-side handshake: resolve, connect, and collect the peer's
/// remote-buffer descriptor from the establishment event.
pub async fn connect_active(
    host: &str,
    port: u16,
    pd: ProtectionDomain,
    cfg: &HandshakeConfig,
) -> Result<(Connection, RemoteBufferDescriptor)> {
    let mut endpoint = Endpoint::new();

    endpoint.resolve(host, port, cfg.resolve_timeout).await?;
    endpoint
        .wait_for_event(CmEventKind::AddrResolved, cfg.resolve_timeout)
        .await?
        .ack();

    endpoint.resolve_route(cfg.resolve_timeout).await?;
    endpoint
        .wait_for_event(CmEventKind::RouteResolved, cfg.resolve_timeout)
        .await?
        .ack();

    let mut conn = Connection::new_active(endpoint, pd, cfg.handshake_timeout).await?;
    conn.connect(&ConnectParams {
        private_data: None,
        responder_resources: 1,
        retry_count: 7,
    })?;

    let payload = conn.wait_established(cfg.handshake_timeout).await?;
    let payload = payload.ok_or_else(|| {
        RdmaError::HandshakeProtocolViolation(
            "establishment event carried no private payload".into(),
        )
    })?;
    let descriptor = RemoteBufferDescriptor::from_wire(&payload)?;

    tracing::info!(
        addr = descriptor.addr,
        rkey = descriptor.rkey,
        "handshake complete, peer buffer descriptor received"
    );
    Ok((conn, descriptor))
}

/// Passive-side handshake: waits for a connection request, builds the
/// connection, runs `pre_post` (the write-notify pre-posting hook) before
/// accepting, then accepts with `region`'s descriptor as private payload.
///
/// `pre_post` runs between queue-pair creation and the accept, which is the
/// only window in which a receive is guaranteed to be posted before the
/// active side can issue its write+notify sequence.
pub async fn accept_passive<F>(
    mut endpoint: Endpoint,
    region: &MemoryRegion,
    pd: ProtectionDomain,
    cfg: &HandshakeConfig,
    pre_post: F,
) -> Result<Connection>
where
    F: FnOnce(&Connection) -> Result<()>,
{
    let guard = endpoint
        .wait_for_event(CmEventKind::ConnectRequest, cfg.handshake_timeout)
        .await?;
    let pending = Endpoint::take_connect_request(guard)?;

    let descriptor = region.descriptor()?;
    let mut conn = Connection::new_passive(endpoint, pending, pd);

    pre_post(&conn)?;

    conn.accept(&ConnectParams {
        private_data: Some(Bytes::copy_from_slice(&descriptor.to_wire())),
        responder_resources: 1,
        retry_count: 7,
    })?;
    conn.wait_established(cfg.handshake_timeout).await?;

    tracing::info!(
        addr = descriptor.addr,
        rkey = descriptor.rkey,
        "handshake complete, buffer descriptor sent to peer"
    );
    Ok(conn)
}
