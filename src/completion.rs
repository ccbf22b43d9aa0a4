//! Completion engine: the completion queue and its notification channel.
//!
//! One queue per connection. The consumer blocks on the notification
//! channel, re-arms the notification request, and only then drains exactly
//! one entry. Re-arming before polling is load-bearing: an entry queued
//! between the wake and the poll self-signals through the fresh arm instead
//! of being lost.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{RdmaError, Result};

/// Completion status as reported by the (emulated) transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// A matched receive was too small for the incoming send.
    LocalLengthError,
    /// A one-sided operation was refused by the responder.
    RemoteAccessError,
    /// The queue pair was torn down with the request still posted.
    WorkRequestFlushed,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WcStatus::Success => "SUCCESS",
            WcStatus::LocalLengthError => "LOCAL_LENGTH_ERROR",
            WcStatus::RemoteAccessError => "REMOTE_ACCESS_ERROR",
            WcStatus::WorkRequestFlushed => "WR_FLUSHED",
        };
        f.write_str(s)
    }
}

/// One finished work request.
#[derive(Clone, Copy, Debug)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub byte_len: u32,
}

/// Correlation tags for the handful of concurrently outstanding operation
/// kinds. The numeric values are the protocol's conventional wr_id scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrTag {
    /// A posted receive (the notify receive, or the client's reply receive).
    ExpectReceive = 0,
    /// The signaled one-sided write.
    ExpectWriteCompletion = 1,
    /// The signaled two-sided send (the notification, or the reply).
    ExpectSendCompletion = 2,
}

impl WrTag {
    pub fn wr_id(self) -> u64 {
        self as u64
    }

    pub fn from_wr_id(wr_id: u64) -> Option<WrTag> {
        match wr_id {
            0 => Some(WrTag::ExpectReceive),
            1 => Some(WrTag::ExpectWriteCompletion),
            2 => Some(WrTag::ExpectSendCompletion),
            _ => None,
        }
    }
}

/// Queue state and notification bookkeeping, serialized under one lock so a
/// push and a re-arm cannot interleave their arm/entry decisions.
struct CqInner {
    entries: VecDeque<WorkCompletion>,
    /// Whether the notification request is armed. One wake is delivered per
    /// arm, as with a verbs completion channel.
    armed: bool,
    /// Entries pushed while the arm was down; each still owes a wake.
    unsignaled: usize,
}

struct CqShared {
    inner: Mutex<CqInner>,
    wake_tx: mpsc::UnboundedSender<()>,
}

/// Producer half, owned by the fabric tasks.
#[derive(Clone)]
pub(crate) struct CqProducer {
    shared: Arc<CqShared>,
}

impl CqProducer {
    pub(crate) fn push(&self, wc: WorkCompletion) {
        let mut inner = self.shared.inner.lock();
        inner.entries.push_back(wc);
        if inner.armed {
            inner.armed = false;
            let _ = self.shared.wake_tx.send(());
        } else {
            inner.unsignaled += 1;
        }
    }
}

/// Consumer half. Single-owner: the connection.
pub struct CompletionQueue {
    shared: Arc<CqShared>,
    wake_rx: mpsc::UnboundedReceiver<()>,
    unacked_events: usize,
}

impl CompletionQueue {
    pub(crate) fn new() -> (CqProducer, CompletionQueue) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CqShared {
            inner: Mutex::new(CqInner {
                entries: VecDeque::new(),
                // Armed from creation, like the initial ibv_req_notify_cq.
                armed: true,
                unsignaled: 0,
            }),
            wake_tx,
        });
        (
            CqProducer {
                shared: Arc::clone(&shared),
            },
            CompletionQueue {
                shared,
                wake_rx,
                unacked_events: 0,
            },
        )
    }

    /// Blocks until one completion can be drained.
    ///
    /// Order of operations is fixed: consume a notification, re-arm, poll
    /// one entry. An empty poll after a wake is `PollMismatch`; a
    /// non-success entry is `CompletionError`; an elapsed bound is
    /// `NotificationTimeout`.
    pub async fn wait_one(&mut self, timeout: Duration) -> Result<WorkCompletion> {
        tokio::time::timeout(timeout, self.wake_rx.recv())
            .await
            .map_err(|_| RdmaError::NotificationTimeout { waited: timeout })?
            .ok_or_else(|| RdmaError::EventChannel("completion channel closed".into()))?;
        self.unacked_events += 1;

        // Re-arm, then poll. An entry that arrived while the arm was down
        // still owes its wake; settle that debt now so the next wait cannot
        // block on a non-empty queue.
        let wc = {
            let mut inner = self.shared.inner.lock();
            if inner.unsignaled > 0 {
                inner.unsignaled -= 1;
                let _ = self.shared.wake_tx.send(());
            } else {
                inner.armed = true;
            }
            inner.entries.pop_front().ok_or(RdmaError::PollMismatch)?
        };

        if !wc.status.is_success() {
            return Err(RdmaError::Completion {
                wr_id: wc.wr_id,
                status: wc.status,
            });
        }
        Ok(wc)
    }

    /// Batch acknowledgment of `n` consumed notification events; identical
    /// in effect to acknowledging them one at a time.
    pub fn ack_events(&mut self, n: usize) {
        self.unacked_events = self.unacked_events.saturating_sub(n);
    }

    /// Notification events consumed but not yet acknowledged.
    pub fn unacked_events(&self) -> usize {
        self.unacked_events
    }

    #[cfg(test)]
    fn spurious_wake(&self) {
        self.shared.inner.lock().armed = false;
        let _ = self.shared.wake_tx.send(());
    }
}
