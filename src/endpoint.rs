//! Transport endpoint: connection identity, address resolution, and the
//! listen/connect lifecycle.
//!
//! The state machine is linear with no backward transitions except into
//! `Closed`:
//!
//! `Idle → AddressResolving → RouteResolving → Connecting/Listening →
//! Established → Disconnecting → Closed`

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::{RdmaError, Result};
use crate::event::{CmEvent, CmEventGuard, CmEventKind, EventChannel, EventSink, PendingConnection};
use crate::wire::{self, Frame};

/// Endpoint lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    AddressResolving,
    RouteResolving,
    Connecting,
    Listening,
    Established,
    Disconnecting,
    Closed,
}

/// One endpoint of a logical link: either a client in the middle of
/// resolution, or a bound listener producing connect-request events.
pub struct Endpoint {
    state: EndpointState,
    events: EventChannel,
    sink: EventSink,
    resolved: Option<SocketAddr>,
}

impl Endpoint {
    /// Creates an idle (client-side) endpoint.
    pub fn new() -> Self {
        let (sink, events) = EventChannel::pair();
        Self {
            state: EndpointState::Idle,
            events,
            sink,
            resolved: None,
        }
    }

    /// Begins address resolution for `host:port`, bounded by `timeout`.
    ///
    /// On success the endpoint queues `ADDR_RESOLVED`; the caller observes
    /// it through [`Endpoint::wait_for_event`].
    pub async fn resolve(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        self.expect_state(EndpointState::Idle)?;
        let target = format!("{host}:{port}");

        let mut addrs = tokio::time::timeout(timeout, tokio::net::lookup_host(&target))
            .await
            .map_err(|_| RdmaError::AddressResolution {
                host: host.to_string(),
                port,
                reason: format!("resolution did not finish within {timeout:?}"),
            })?
            .map_err(|e| RdmaError::AddressResolution {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        let addr = addrs.next().ok_or_else(|| RdmaError::AddressResolution {
            host: host.to_string(),
            port,
            reason: "name resolved to no addresses".into(),
        })?;

        tracing::debug!(%addr, "address resolved");
        self.resolved = Some(addr);
        self.state = EndpointState::AddressResolving;
        self.sink.push(CmEvent::bare(CmEventKind::AddrResolved));
        Ok(())
    }

    /// Begins route resolution. The emulated fabric has no separate routing
    /// step, so the event fires as soon as resolution is requested.
    pub async fn resolve_route(&mut self, _timeout: Duration) -> Result<()> {
        self.expect_state(EndpointState::AddressResolving)?;
        self.state = EndpointState::RouteResolving;
        self.sink.push(CmEvent::bare(CmEventKind::RouteResolved));
        Ok(())
    }

    /// Blocks until the next connection-management event arrives and checks
    /// it against `expected`.
    pub async fn wait_for_event(
        &mut self,
        expected: CmEventKind,
        timeout: Duration,
    ) -> Result<CmEventGuard> {
        self.events.wait_for(expected, timeout).await
    }

    /// Binds a listener on `port` and starts producing `CONNECT_REQUEST`
    /// events, at most `backlog` of them pending at a time.
    pub async fn listen(port: u16, backlog: usize) -> Result<Endpoint> {
        let (sink, events) = EventChannel::pair();
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local = listener.local_addr()?;
        tracing::info!(%local, backlog, "listening for connection requests");

        let acceptor_sink = sink.clone();
        tokio::spawn(acceptor_loop(listener, acceptor_sink, backlog));

        Ok(Self {
            state: EndpointState::Listening,
            events,
            sink,
            resolved: Some(local),
        })
    }

    /// Extracts the pending connection from a `CONNECT_REQUEST` guard.
    pub fn take_connect_request(guard: CmEventGuard) -> Result<PendingConnection> {
        guard.into_connect_request()
    }

    /// Dials the resolved peer. Refusal or an elapsed bound both mean the
    /// handshake cannot reach `ESTABLISHED` in time.
    pub(crate) async fn dial(&mut self, timeout: Duration) -> Result<TcpStream> {
        self.expect_state(EndpointState::RouteResolving)?;
        let addr = self
            .resolved
            .ok_or_else(|| RdmaError::HandshakeProtocolViolation("dial before resolve".into()))?;

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RdmaError::HandshakeTimeout {
                waiting_for: CmEventKind::Established,
            })?
            .map_err(|e| {
                tracing::debug!(%addr, error = %e, "dial failed");
                RdmaError::HandshakeTimeout {
                    waiting_for: CmEventKind::Established,
                }
            })?;
        stream.set_nodelay(true)?;
        self.state = EndpointState::Connecting;
        Ok(stream)
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// The resolved peer address (client) or bound local address (listener).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.resolved
    }

    pub(crate) fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub(crate) fn events_mut(&mut self) -> &mut EventChannel {
        &mut self.events
    }

    pub(crate) fn set_state(&mut self, state: EndpointState) {
        tracing::trace!(from = ?self.state, to = ?state, "endpoint state transition");
        self.state = state;
    }

    pub fn outstanding_events(&self) -> usize {
        self.events.outstanding_events()
    }

    fn expect_state(&self, expected: EndpointState) -> Result<()> {
        if self.state != expected {
            return Err(RdmaError::HandshakeProtocolViolation(format!(
                "operation requires state {expected:?}, endpoint is {:?}",
                self.state
            )));
        }
        Ok(())
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts streams, reads each one's connect-request frame, and queues the
/// corresponding CM event. The semaphore holds accepted-but-unclaimed
/// requests at the configured backlog.
async fn acceptor_loop(listener: TcpListener, sink: EventSink, backlog: usize) {
    let permits = Semaphore::new(backlog.max(1));
    loop {
        // Queue depth bound; permits are intentionally never returned, the
        // single-connection lifecycle claims the request instead.
        if permits.acquire().await.map(|p| p.forget()).is_err() {
            break;
        }
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "listener accept failed");
                continue;
            }
        };
        tracing::debug!(%peer, "incoming stream, awaiting connect request");
        if let Err(e) = handle_incoming(stream, &sink).await {
            tracing::warn!(%peer, error = %e, "dropping malformed connect attempt");
        }
    }
}

async fn handle_incoming(mut stream: TcpStream, sink: &EventSink) -> Result<()> {
    stream.set_nodelay(true)?;
    match wire::read_frame(&mut stream).await? {
        Some(Frame::ConnectRequest { private_data }) => {
            wire::check_private_data_len(private_data.len())?;
            let private_data =
                (!private_data.is_empty()).then(|| Bytes::from(private_data));
            sink.push(CmEvent {
                kind: CmEventKind::ConnectRequest,
                private_data,
                stream: Some(stream),
            });
            Ok(())
        }
        Some(other) => Err(RdmaError::HandshakeProtocolViolation(format!(
            "first frame was {other:?}, expected a connect request"
        ))),
        None => Err(RdmaError::HandshakeProtocolViolation(
            "stream closed before the connect request".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn resolve_walks_the_state_machine() {
        let mut ep = Endpoint::new();
        assert_eq!(ep.state(), EndpointState::Idle);

        ep.resolve("127.0.0.1", 9191, T).await.unwrap();
        assert_eq!(ep.state(), EndpointState::AddressResolving);
        ep.wait_for_event(CmEventKind::AddrResolved, T)
            .await
            .unwrap()
            .ack();

        ep.resolve_route(T).await.unwrap();
        assert_eq!(ep.state(), EndpointState::RouteResolving);
        ep.wait_for_event(CmEventKind::RouteResolved, T)
            .await
            .unwrap()
            .ack();
    }

    #[tokio::test]
    async fn resolve_rejects_unresolvable_names() {
        let mut ep = Endpoint::new();
        let err = ep
            .resolve("no-such-host.invalid", 9191, T)
            .await
            .unwrap_err();
        assert!(matches!(err, RdmaError::AddressResolution { .. }));
    }

    #[tokio::test]
    async fn route_resolution_requires_resolved_address() {
        let mut ep = Endpoint::new();
        assert!(matches!(
            ep.resolve_route(T).await.unwrap_err(),
            RdmaError::HandshakeProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn listener_queues_connect_request_with_private_data() {
        let mut ep = Endpoint::listen(0, 1).await.unwrap();
        let addr = ep.resolved.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_frame(
            &mut stream,
            &Frame::ConnectRequest {
                private_data: b"hello".to_vec(),
            },
        )
        .await
        .unwrap();

        let guard = ep
            .wait_for_event(CmEventKind::ConnectRequest, T)
            .await
            .unwrap();
        let pending = Endpoint::take_connect_request(guard).unwrap();
        assert_eq!(pending.private_data(), Some(&b"hello"[..]));
    }
}
