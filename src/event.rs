//! Connection-management events and the event channel.
//!
//! Every CM state transition is observed as an event pulled from the
//! endpoint's channel. Events must be acknowledged exactly once; the guard
//! returned by [`EventChannel::wait_for`] acknowledges on drop, so failure
//! paths cannot leak an unacknowledged event, and `ack` consumes the guard,
//! so a double acknowledgment is unrepresentable.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{RdmaError, Result};

/// The rdma_cm event set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    AddrChange,
    TimewaitExit,
}

impl CmEventKind {
    /// Human-readable event name.
    pub fn name(self) -> &'static str {
        match self {
            CmEventKind::AddrResolved => "ADDR_RESOLVED",
            CmEventKind::AddrError => "ADDR_ERROR",
            CmEventKind::RouteResolved => "ROUTE_RESOLVED",
            CmEventKind::RouteError => "ROUTE_ERROR",
            CmEventKind::ConnectRequest => "CONNECT_REQUEST",
            CmEventKind::ConnectResponse => "CONNECT_RESPONSE",
            CmEventKind::ConnectError => "CONNECT_ERROR",
            CmEventKind::Unreachable => "UNREACHABLE",
            CmEventKind::Rejected => "REJECTED",
            CmEventKind::Established => "ESTABLISHED",
            CmEventKind::Disconnected => "DISCONNECTED",
            CmEventKind::DeviceRemoval => "DEVICE_REMOVAL",
            CmEventKind::AddrChange => "ADDR_CHANGE",
            CmEventKind::TimewaitExit => "TIMEWAIT_EXIT",
        }
    }
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single connection-management event.
///
/// `ConnectRequest` events additionally carry the accepted stream; it is
/// handed off to the passive-side connection via
/// [`CmEventGuard::into_connect_request`].
pub struct CmEvent {
    pub kind: CmEventKind,
    pub private_data: Option<Bytes>,
    pub(crate) stream: Option<TcpStream>,
}

impl CmEvent {
    pub(crate) fn bare(kind: CmEventKind) -> Self {
        Self {
            kind,
            private_data: None,
            stream: None,
        }
    }

    #[cfg(test)]
    fn with_private_data(kind: CmEventKind, data: Bytes) -> Self {
        Self {
            kind,
            private_data: Some(data),
            stream: None,
        }
    }
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.kind)
            .field(
                "private_data",
                &self.private_data.as_ref().map(|d| d.len()),
            )
            .finish()
    }
}

/// Producer half of the event channel, cloned into the fabric tasks.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<CmEvent>,
}

impl EventSink {
    /// Queues an event. Dropped silently if the consumer is gone; the
    /// consumer going away means the endpoint is being torn down.
    pub(crate) fn push(&self, event: CmEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event channel consumer gone, dropping event");
        }
    }
}

/// Consumer half of the event channel. Single-owner, one per endpoint.
pub struct EventChannel {
    rx: mpsc::UnboundedReceiver<CmEvent>,
    outstanding: Arc<AtomicUsize>,
}

impl EventChannel {
    pub(crate) fn pair() -> (EventSink, EventChannel) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink { tx },
            EventChannel {
                rx,
                outstanding: Arc::new(AtomicUsize::new(0)),
            },
        )
    }

    /// Blocks until the next event arrives and checks it against `expected`.
    ///
    /// On a kind mismatch the event is acknowledged before the error is
    /// returned, then `UnexpectedEvent` is surfaced. A closed channel is
    /// `EventChannelError`; an elapsed bound is `HandshakeTimeout`.
    pub async fn wait_for(
        &mut self,
        expected: CmEventKind,
        timeout: Duration,
    ) -> Result<CmEventGuard> {
        let guard = self.next_event(expected, timeout).await?;
        if guard.kind() != expected {
            let actual = guard.kind();
            // Guard drop acknowledges the mismatched event.
            drop(guard);
            return Err(RdmaError::UnexpectedEvent { expected, actual });
        }
        Ok(guard)
    }

    /// Blocks until the next event arrives, whatever its kind.
    pub(crate) async fn next_event(
        &mut self,
        waiting_for: CmEventKind,
        timeout: Duration,
    ) -> Result<CmEventGuard> {
        let event = tokio::time::timeout(timeout, self.rx.recv())
            .await
            .map_err(|_| RdmaError::HandshakeTimeout { waiting_for })?
            .ok_or_else(|| RdmaError::EventChannel("channel closed".into()))?;

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(CmEventGuard {
            event,
            outstanding: Arc::clone(&self.outstanding),
            acked: false,
        })
    }

    /// Number of events obtained but not yet acknowledged.
    pub fn outstanding_events(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// An event pulled from the channel, pending acknowledgment.
///
/// The private payload is only reachable through the guard; callers that
/// need it must copy it out before acknowledging, exactly as rdma_cm
/// requires.
pub struct CmEventGuard {
    event: CmEvent,
    outstanding: Arc<AtomicUsize>,
    acked: bool,
}

impl std::fmt::Debug for CmEventGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmEventGuard")
            .field("kind", &self.event.kind)
            .field("acked", &self.acked)
            .finish_non_exhaustive()
    }
}

impl CmEventGuard {
    pub fn kind(&self) -> CmEventKind {
        self.event.kind
    }

    pub fn private_data(&self) -> Option<&[u8]> {
        self.event.private_data.as_deref()
    }

    /// Copies the private payload out of the event's storage.
    pub fn copy_private_data(&self) -> Option<Bytes> {
        self.event.private_data.clone()
    }

    /// Acknowledges the event, releasing its channel slot.
    pub fn ack(mut self) {
        self.do_ack();
    }

    /// Extracts the pending connection from a `ConnectRequest` event and
    /// acknowledges it. Any other kind is a protocol error.
    pub(crate) fn into_connect_request(mut self) -> Result<PendingConnection> {
        if self.event.kind != CmEventKind::ConnectRequest {
            return Err(RdmaError::UnexpectedEvent {
                expected: CmEventKind::ConnectRequest,
                actual: self.event.kind,
            });
        }
        let stream = self.event.stream.take().ok_or_else(|| {
            RdmaError::EventChannel("connect request event lost its stream".into())
        })?;
        let private_data = self.event.private_data.clone();
        self.do_ack();
        Ok(PendingConnection {
            stream,
            private_data,
        })
    }

    fn do_ack(&mut self) {
        if !self.acked {
            self.acked = true;
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for CmEventGuard {
    fn drop(&mut self) {
        // Acknowledge-on-drop keeps failure paths from leaking the event.
        self.do_ack();
    }
}

/// A connection request copied out of the acceptor's event, ready to be
/// turned into a passive-side connection.
pub struct PendingConnection {
    pub(crate) stream: TcpStream,
    pub(crate) private_data: Option<Bytes>,
}

impl PendingConnection {
    pub fn private_data(&self) -> Option<&[u8]> {
        self.private_data.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(200);

    #[test]
    fn event_names_match_rdma_cm() {
        assert_eq!(CmEventKind::Established.name(), "ESTABLISHED");
        assert_eq!(CmEventKind::ConnectRequest.name(), "CONNECT_REQUEST");
        assert_eq!(format!("{}", CmEventKind::Disconnected), "DISCONNECTED");
    }

    #[tokio::test]
    async fn wait_for_matching_event() {
        let (sink, mut channel) = EventChannel::pair();
        sink.push(CmEvent::bare(CmEventKind::AddrResolved));

        let guard = channel.wait_for(CmEventKind::AddrResolved, T).await.unwrap();
        assert_eq!(guard.kind(), CmEventKind::AddrResolved);
        assert_eq!(channel.outstanding_events(), 1);
        guard.ack();
        assert_eq!(channel.outstanding_events(), 0);
    }

    #[tokio::test]
    async fn mismatched_event_is_acked_and_reported() {
        let (sink, mut channel) = EventChannel::pair();
        sink.push(CmEvent::bare(CmEventKind::Rejected));

        let err = channel
            .wait_for(CmEventKind::Established, T)
            .await
            .unwrap_err();
        match err {
            RdmaError::UnexpectedEvent { expected, actual } => {
                assert_eq!(expected, CmEventKind::Established);
                assert_eq!(actual, CmEventKind::Rejected);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The mismatched event was still acknowledged.
        assert_eq!(channel.outstanding_events(), 0);
    }

    #[tokio::test]
    async fn drop_acknowledges_exactly_once() {
        let (sink, mut channel) = EventChannel::pair();
        sink.push(CmEvent::bare(CmEventKind::Established));
        sink.push(CmEvent::bare(CmEventKind::Disconnected));

        let first = channel.wait_for(CmEventKind::Established, T).await.unwrap();
        drop(first);
        assert_eq!(channel.outstanding_events(), 0);

        // A second drop path cannot re-release the same slot: the next
        // event's guard accounts independently.
        let second = channel
            .wait_for(CmEventKind::Disconnected, T)
            .await
            .unwrap();
        assert_eq!(channel.outstanding_events(), 1);
        second.ack();
        assert_eq!(channel.outstanding_events(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_as_handshake_timeout() {
        let (_sink, mut channel) = EventChannel::pair();
        let err = channel
            .wait_for(CmEventKind::Established, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RdmaError::HandshakeTimeout {
                waiting_for: CmEventKind::Established
            }
        ));
    }

    #[tokio::test]
    async fn closed_channel_is_event_channel_error() {
        let (sink, mut channel) = EventChannel::pair();
        drop(sink);
        let err = channel
            .wait_for(CmEventKind::Established, T)
            .await
            .unwrap_err();
        assert!(matches!(err, RdmaError::EventChannel(_)));
    }

    #[tokio::test]
    async fn private_data_copied_before_ack() {
        let (sink, mut channel) = EventChannel::pair();
        sink.push(CmEvent::with_private_data(
            CmEventKind::Established,
            Bytes::from_static(b"pdata"),
        ));

        let guard = channel.wait_for(CmEventKind::Established, T).await.unwrap();
        let copied = guard.copy_private_data().unwrap();
        guard.ack();
        assert_eq!(&copied[..], b"pdata");
    }
}
