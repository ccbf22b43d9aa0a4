//! A single logical link: one queue pair, one completion queue, one
//! protection domain, plus the fabric tasks that move frames.
//!
//! The fabric reader applies inbound one-sided writes directly to the
//! registered region and generates **no** completion for them; inbound sends
//! are matched against posted receives in FIFO order. The fabric writer
//! pushes a signaled request's completion only after its frame has reached
//! the socket, so completions are observed in submission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::completion::{CompletionQueue, CqProducer, WcStatus, WorkCompletion};
use crate::endpoint::{Endpoint, EndpointState};
use crate::error::{RdmaError, Result};
use crate::event::{CmEvent, CmEventKind, EventSink, PendingConnection};
use crate::memory::{MemoryRegion, ProtectionDomain, RegionPin};
use crate::wire::{self, Frame, RemoteBufferDescriptor};

/// Connection parameters carried alongside connect/accept, including the
/// opaque private payload the handshake protocol rides on.
#[derive(Clone, Debug, Default)]
pub struct ConnectParams {
    pub private_data: Option<Bytes>,
    pub responder_resources: u8,
    pub retry_count: u8,
}

impl ConnectParams {
    fn validated_payload(&self) -> Result<Vec<u8>> {
        let data = self.private_data.as_deref().unwrap_or(&[]);
        wire::check_private_data_len(data.len())?;
        Ok(data.to_vec())
    }
}

/// What a passive-side wait observed: a drained completion, or the peer
/// going away.
#[derive(Debug)]
pub enum CycleEvent {
    Completion(WorkCompletion),
    Disconnected,
}

/// An outbound work request or control frame queued to the fabric writer.
enum Outbound {
    Control(Frame),
    Signaled {
        frame: Frame,
        wr_id: u64,
        byte_len: u32,
        _pin: RegionPin,
    },
    Unsignaled {
        frame: Frame,
        _pin: RegionPin,
    },
}

/// A receive work request waiting for an inbound send.
struct RecvSlot {
    wr_id: u64,
    region: Arc<crate::memory::RegionState>,
    _pin: RegionPin,
}

/// Send/receive queues through which work requests are submitted.
pub struct QueuePair {
    outbound: mpsc::UnboundedSender<Outbound>,
    recv_queue: Arc<Mutex<VecDeque<RecvSlot>>>,
    established: Arc<AtomicBool>,
}

impl QueuePair {
    /// Posts a signaled or unsignaled one-sided write of the first `len`
    /// bytes of `local` at the peer region named by `remote`.
    pub fn post_write(
        &self,
        wr_id: u64,
        local: &MemoryRegion,
        len: usize,
        remote: &RemoteBufferDescriptor,
        signaled: bool,
    ) -> Result<()> {
        self.require_established()?;
        if len > local.len() {
            return Err(RdmaError::Registration(format!(
                "write of {len} bytes exceeds local region length {}",
                local.len()
            )));
        }
        let frame = Frame::Write {
            raddr: remote.addr,
            rkey: remote.rkey,
            data: local.read_prefix(len),
        };
        self.submit(frame, wr_id, len as u32, signaled, local.pin())
    }

    /// Posts a two-sided send of the first `len` bytes of `local`.
    pub fn post_send(
        &self,
        wr_id: u64,
        local: &MemoryRegion,
        len: usize,
        signaled: bool,
    ) -> Result<()> {
        self.require_established()?;
        if len > local.len() {
            return Err(RdmaError::Registration(format!(
                "send of {len} bytes exceeds local region length {}",
                local.len()
            )));
        }
        let frame = Frame::Send {
            data: local.read_prefix(len),
        };
        self.submit(frame, wr_id, len as u32, signaled, local.pin())
    }

    /// Posts a receive targeting `region`. Receives may be pre-posted before
    /// the connection is established; the write-notify ordering requirement
    /// depends on it.
    pub fn post_recv(&self, wr_id: u64, region: &MemoryRegion) -> Result<()> {
        let slot = RecvSlot {
            wr_id,
            region: region.state_arc(),
            _pin: region.pin(),
        };
        self.recv_queue.lock().push_back(slot);
        Ok(())
    }

    fn submit(
        &self,
        frame: Frame,
        wr_id: u64,
        byte_len: u32,
        signaled: bool,
        pin: RegionPin,
    ) -> Result<()> {
        let outbound = if signaled {
            Outbound::Signaled {
                frame,
                wr_id,
                byte_len,
                _pin: pin,
            }
        } else {
            Outbound::Unsignaled { frame, _pin: pin }
        };
        self.outbound
            .send(outbound)
            .map_err(|_| RdmaError::EventChannel("fabric writer is gone".into()))
    }

    fn send_control(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(Outbound::Control(frame))
            .map_err(|_| RdmaError::EventChannel("fabric writer is gone".into()))
    }

    fn require_established(&self) -> Result<()> {
        if !self.established.load(Ordering::SeqCst) {
            return Err(RdmaError::NotEstablished);
        }
        Ok(())
    }
}

/// One logical link. Owns the queue pair, completion queue, protection
/// domain, and the endpoint's event channel; dropping the connection aborts
/// the fabric tasks.
pub struct Connection {
    endpoint: Endpoint,
    pd: ProtectionDomain,
    cq: CompletionQueue,
    qp: QueuePair,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Active side: dials the endpoint's resolved address and brings up the
    /// fabric. The endpoint must have completed route resolution.
    pub async fn new_active(
        mut endpoint: Endpoint,
        pd: ProtectionDomain,
        timeout: Duration,
    ) -> Result<Connection> {
        let stream = endpoint.dial(timeout).await?;
        Ok(Self::from_stream(endpoint, pd, stream))
    }

    /// Passive side: brings up the fabric over an accepted connect request.
    /// Receives may be posted immediately, before `accept` is called.
    pub fn new_passive(
        mut endpoint: Endpoint,
        pending: PendingConnection,
        pd: ProtectionDomain,
    ) -> Connection {
        endpoint.set_state(EndpointState::Connecting);
        Self::from_stream(endpoint, pd, pending.stream)
    }

    fn from_stream(endpoint: Endpoint, pd: ProtectionDomain, stream: TcpStream) -> Connection {
        let (read_half, write_half) = stream.into_split();
        let (cq_producer, cq) = CompletionQueue::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let recv_queue = Arc::new(Mutex::new(VecDeque::new()));
        let established = Arc::new(AtomicBool::new(false));

        let qp = QueuePair {
            outbound: outbound_tx,
            recv_queue: Arc::clone(&recv_queue),
            established: Arc::clone(&established),
        };

        let reader = tokio::spawn(fabric_reader(
            read_half,
            pd.clone(),
            Arc::clone(&recv_queue),
            cq_producer.clone(),
            endpoint.sink(),
            qp.outbound.clone(),
        ));
        let writer = tokio::spawn(fabric_writer(write_half, outbound_rx, cq_producer));

        Connection {
            endpoint,
            pd,
            cq,
            qp,
            reader,
            writer,
        }
    }

    /// Initiates link establishment from the active side.
    pub fn connect(&mut self, params: &ConnectParams) -> Result<()> {
        let private_data = params.validated_payload()?;
        self.qp
            .send_control(Frame::ConnectRequest { private_data })?;
        self.endpoint.set_state(EndpointState::Connecting);
        Ok(())
    }

    /// Accepts the pending request, embedding the private payload the peer
    /// will observe in its `ESTABLISHED` event.
    pub fn accept(&mut self, params: &ConnectParams) -> Result<()> {
        let private_data = params.validated_payload()?;
        self.qp.send_control(Frame::Accept { private_data })
    }

    /// Declines the pending request; the peer observes `REJECTED`.
    pub fn reject(&mut self) -> Result<()> {
        self.qp.send_control(Frame::Reject)
    }

    /// Waits for `ESTABLISHED`, returning any private payload the event
    /// carried. The payload is copied out of the event before it is
    /// acknowledged.
    pub async fn wait_established(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let guard = self
            .endpoint
            .wait_for_event(CmEventKind::Established, timeout)
            .await?;
        let private_data = guard.copy_private_data();
        guard.ack();
        self.qp.established.store(true, Ordering::SeqCst);
        self.endpoint.set_state(EndpointState::Established);
        Ok(private_data)
    }

    /// Blocks until the next connection-management event arrives.
    pub async fn wait_for_event(
        &mut self,
        expected: CmEventKind,
        timeout: Duration,
    ) -> Result<crate::event::CmEventGuard> {
        self.endpoint.wait_for_event(expected, timeout).await
    }

    /// Waits for either a work completion or the peer's disconnect,
    /// whichever arrives first. Any CM event other than `DISCONNECTED` is a
    /// protocol violation here.
    pub async fn completion_or_disconnect(&mut self, timeout: Duration) -> Result<CycleEvent> {
        tokio::select! {
            wc = self.cq.wait_one(timeout) => Ok(CycleEvent::Completion(wc?)),
            guard = self
                .endpoint
                .events_mut()
                .next_event(CmEventKind::Disconnected, timeout) =>
            {
                let guard = guard?;
                let kind = guard.kind();
                guard.ack();
                if kind != CmEventKind::Disconnected {
                    return Err(RdmaError::UnexpectedEvent {
                        expected: CmEventKind::Disconnected,
                        actual: kind,
                    });
                }
                self.qp.established.store(false, Ordering::SeqCst);
                self.endpoint.set_state(EndpointState::Disconnecting);
                Ok(CycleEvent::Disconnected)
            }
        }
    }

    /// Initiates teardown. The peer observes `DISCONNECTED`; so does this
    /// side, and it must acknowledge that event before releasing the queue
    /// pair.
    pub fn disconnect(&mut self) -> Result<()> {
        self.qp.send_control(Frame::Disconnect)?;
        self.qp.established.store(false, Ordering::SeqCst);
        self.endpoint.set_state(EndpointState::Disconnecting);
        // The local side observes the disconnect through the same channel.
        self.endpoint
            .sink()
            .push(CmEvent::bare(CmEventKind::Disconnected));
        Ok(())
    }

    /// Waits for and acknowledges the `DISCONNECTED` event.
    pub async fn wait_disconnected(&mut self, timeout: Duration) -> Result<()> {
        let guard = self
            .endpoint
            .wait_for_event(CmEventKind::Disconnected, timeout)
            .await?;
        guard.ack();
        self.qp.established.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Tears the connection down: flushes unmatched receives, stops the
    /// fabric tasks, and closes the endpoint.
    pub fn close(mut self) -> Result<()> {
        for slot in self.qp.recv_queue.lock().drain(..) {
            tracing::debug!(wr_id = slot.wr_id, "flushing unmatched posted receive");
        }
        self.reader.abort();
        self.writer.abort();
        let leaked = self.endpoint.outstanding_events();
        if leaked > 0 {
            tracing::warn!(leaked, "connection closed with unacknowledged events");
        }
        if self.cq.unacked_events() > 0 {
            tracing::warn!(
                unacked = self.cq.unacked_events(),
                "connection closed with unacknowledged completion events"
            );
        }
        self.endpoint.set_state(EndpointState::Closed);
        Ok(())
    }

    pub fn pd(&self) -> &ProtectionDomain {
        &self.pd
    }

    pub fn qp(&self) -> &QueuePair {
        &self.qp
    }

    pub fn cq_mut(&mut self) -> &mut CompletionQueue {
        &mut self.cq
    }

    pub fn state(&self) -> EndpointState {
        self.endpoint.state()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Applies inbound frames: writes to memory, sends to posted receives,
/// control frames to CM events.
async fn fabric_reader(
    mut read_half: OwnedReadHalf,
    pd: ProtectionDomain,
    recv_queue: Arc<Mutex<VecDeque<RecvSlot>>>,
    completions: CqProducer,
    events: EventSink,
    outbound: mpsc::UnboundedSender<Outbound>,
) {
    loop {
        let frame = match wire::read_frame(&mut read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("fabric stream closed by peer");
                events.push(CmEvent::bare(CmEventKind::Disconnected));
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "fabric read failed");
                events.push(CmEvent::bare(CmEventKind::Disconnected));
                return;
            }
        };

        match frame {
            Frame::Accept { private_data } => {
                // Active side: the accept's payload is surfaced through the
                // ESTABLISHED event; confirm establishment to the acceptor.
                let private_data = (!private_data.is_empty()).then(|| Bytes::from(private_data));
                let _ = outbound.send(Outbound::Control(Frame::Ready));
                events.push(CmEvent {
                    kind: CmEventKind::Established,
                    private_data,
                    stream: None,
                });
            }
            Frame::Ready => {
                events.push(CmEvent::bare(CmEventKind::Established));
            }
            Frame::Reject => {
                events.push(CmEvent::bare(CmEventKind::Rejected));
            }
            Frame::Write { raddr, rkey, data } => {
                apply_remote_write(&pd, raddr, rkey, &data);
            }
            Frame::Send { data } => {
                deliver_send(&recv_queue, &completions, data);
            }
            Frame::Disconnect => {
                events.push(CmEvent::bare(CmEventKind::Disconnected));
                return;
            }
            Frame::ConnectRequest { .. } => {
                tracing::warn!("connect request on an established fabric, ignoring");
            }
        }
    }
}

/// A one-sided write: validated against the region's access rights and
/// bounds, applied to memory, and deliberately completion-free on this side.
fn apply_remote_write(pd: &ProtectionDomain, raddr: u64, rkey: u32, data: &[u8]) {
    let Some(region) = pd.lookup(rkey) else {
        tracing::error!(rkey, "one-sided write targets an unknown rkey");
        return;
    };
    if !region.access.allows_remote_write() {
        tracing::error!(rkey, "one-sided write targets a region without remote access");
        return;
    }
    let Some(offset) = raddr.checked_sub(region.addr).map(|o| o as usize) else {
        tracing::error!(rkey, raddr, "one-sided write below region base");
        return;
    };
    let mut buf = region.buf.lock();
    let Some(end) = offset.checked_add(data.len()).filter(|&end| end <= buf.len()) else {
        tracing::error!(
            rkey,
            offset,
            len = data.len(),
            "one-sided write exceeds region bounds"
        );
        return;
    };
    buf[offset..end].copy_from_slice(data);
    tracing::trace!(rkey, offset, len = data.len(), "applied one-sided write");
}

/// A two-sided send: matched FIFO against posted receives. With no receive
/// posted the message is dropped, which is what the protocol-ordering
/// requirement on pre-posting exists to prevent.
fn deliver_send(
    recv_queue: &Mutex<VecDeque<RecvSlot>>,
    completions: &CqProducer,
    data: Vec<u8>,
) {
    let Some(slot) = recv_queue.lock().pop_front() else {
        tracing::warn!(
            len = data.len(),
            "send arrived with no posted receive, dropping"
        );
        return;
    };

    let wr_id = slot.wr_id;
    let fits = {
        let mut buf = slot.region.buf.lock();
        if data.len() <= buf.len() {
            buf[..data.len()].copy_from_slice(&data);
            true
        } else {
            false
        }
    };
    // Release the receive's pin before the completion goes out: once the
    // consumer observes the completion it may deregister the region.
    drop(slot);

    let wc = if fits {
        WorkCompletion {
            wr_id,
            status: WcStatus::Success,
            byte_len: data.len() as u32,
        }
    } else {
        WorkCompletion {
            wr_id,
            status: WcStatus::LocalLengthError,
            byte_len: 0,
        }
    };
    completions.push(wc);
}

/// Serializes outbound frames; a signaled request's completion is pushed
/// only after its frame reaches the socket.
async fn fabric_writer(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    completions: CqProducer,
) {
    while let Some(item) = outbound.recv().await {
        // The pin outlives the socket write so the source region stays
        // registered until the frame is on the wire.
        let (frame, completion, _pin) = match item {
            Outbound::Control(frame) => (frame, None, None),
            Outbound::Unsignaled { frame, _pin } => (frame, None, Some(_pin)),
            Outbound::Signaled {
                frame,
                wr_id,
                byte_len,
                _pin,
            } => (frame, Some((wr_id, byte_len)), Some(_pin)),
        };

        let write_result = wire::write_frame(&mut write_half, &frame).await;
        // Release the pin before the completion goes out: once a caller
        // observes the completion it may deregister the source region.
        drop(_pin);

        if let Err(e) = write_result {
            tracing::warn!(error = %e, "fabric write failed");
            if let Some((wr_id, _)) = completion {
                completions.push(WorkCompletion {
                    wr_id,
                    status: WcStatus::WorkRequestFlushed,
                    byte_len: 0,
                });
            }
            // Nothing further reaches the wire; every signaled request
            // still queued gets its flush completion too, so no posted
            // work request is left without exactly one completion.
            outbound.close();
            while let Ok(item) = outbound.try_recv() {
                if let Outbound::Signaled { wr_id, .. } = item {
                    completions.push(WorkCompletion {
                        wr_id,
                        status: WcStatus::WorkRequestFlushed,
                        byte_len: 0,
                    });
                }
            }
            return;
        }

        if let Some((wr_id, byte_len)) = completion {
            completions.push(WorkCompletion {
                wr_id,
                status: WcStatus::Success,
                byte_len,
            });
        }
    }
}
