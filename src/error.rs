//! Error taxonomy for the connection and write-notify protocol.
//!
//! Nothing in this crate retries automatically; every failure unwinds to the
//! caller with enough context (expected vs. actual event, operation tag,
//! completion status) to log and exit.

use std::time::Duration;

use crate::completion::{WcStatus, WrTag};
use crate::event::CmEventKind;

/// All fatal and timing-related failures the core can surface.
#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    /// Name resolution failed or timed out before an address was found.
    #[error("address resolution failed for {host}:{port}: {reason}")]
    AddressResolution {
        host: String,
        port: u16,
        reason: String,
    },

    /// The connection did not reach the expected CM state within the bound.
    #[error("handshake timed out waiting for {waiting_for}")]
    HandshakeTimeout { waiting_for: CmEventKind },

    /// A bounded completion wait elapsed with no completion delivered.
    #[error("no completion arrived within {waited:?}")]
    NotificationTimeout { waited: Duration },

    /// A connection-management event arrived out of sequence. The connection
    /// is desynchronized and must be torn down.
    #[error("expected CM event {expected}, got {actual}")]
    UnexpectedEvent {
        expected: CmEventKind,
        actual: CmEventKind,
    },

    /// The handshake carried malformed or missing data.
    #[error("handshake protocol violation: {0}")]
    HandshakeProtocolViolation(String),

    /// The CM event channel closed or errored underneath a wait.
    #[error("event channel error: {0}")]
    EventChannel(String),

    /// Connection private payload exceeds the fixed maximum.
    #[error("private payload of {len} bytes exceeds the {max}-byte maximum")]
    PayloadTooLarge { len: usize, max: usize },

    /// Memory region registration was refused.
    #[error("memory registration failed: {0}")]
    Registration(String),

    /// Deregistration attempted while operations still reference the region.
    #[error("memory region {lkey:#x} has {in_flight} in-flight operation(s)")]
    RegionBusy { lkey: u32, in_flight: usize },

    /// The completion channel signaled but the queue held no entry. This is
    /// a protocol violation, not a retryable condition.
    #[error("completion channel woke but the queue was empty")]
    PollMismatch,

    /// The transport reported a failed work completion.
    #[error("work request {wr_id} completed with status {status}")]
    Completion { wr_id: u64, status: WcStatus },

    /// A completion carried a correlation tag other than the one the
    /// protocol step was waiting on.
    #[error("expected completion for {expected:?}, got wr_id {actual}")]
    UnexpectedCompletion { expected: WrTag, actual: u64 },

    /// Allocation or resource-limit failure. Fatal for the connection.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// A data-path operation was posted outside the Established state.
    #[error("connection is not established")]
    NotEstablished,

    /// Socket-level failure in the emulated fabric.
    #[error("fabric i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RdmaError>;
