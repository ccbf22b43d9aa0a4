//! Write-notify protocol: the one-sided write followed by the explicit
//! notification that tells the passive side the data has landed.
//!
//! A one-sided write produces no completion on the passive side, so the
//! passive side must not read its buffer until the companion notification's
//! receive completion has been observed. The receive for that notification
//! has to be posted before the active side issues its write+notify sequence;
//! this module pins the write target for the whole cycle so the region
//! cannot be deregistered out from under an in-flight write.

use std::time::Duration;

use crate::completion::WrTag;
use crate::connection::{Connection, CycleEvent};
use crate::error::{RdmaError, Result};
use crate::memory::{AccessRights, MemoryRegion, RegionPin};
use crate::wire::RemoteBufferDescriptor;

/// Size of the auxiliary region dedicated to notification messages.
pub const NOTIFY_REGION_LEN: usize = 4;

/// A posted notification receive, pinning the data region for the cycle.
pub struct PostedNotify {
    notify_mr: MemoryRegion,
    _data_pin: RegionPin,
}

/// Passive side, step 1: register the tiny notify region and post its
/// receive. Must happen before the active side's write+notify is issued;
/// the returned handle holds `data_region` busy until the notification is
/// observed (or the cycle is abandoned).
pub fn post_notify_receive(conn: &Connection, data_region: &MemoryRegion) -> Result<PostedNotify> {
    let notify_mr = conn
        .pd()
        .register(vec![0u8; NOTIFY_REGION_LEN], AccessRights::LocalWrite)?;
    conn.qp()
        .post_recv(WrTag::ExpectReceive.wr_id(), &notify_mr)?;
    tracing::debug!("notification receive posted");
    Ok(PostedNotify {
        notify_mr,
        _data_pin: data_region.pin(),
    })
}

/// Passive side, step 2: wait for the notification's receive completion.
/// Only after this returns is the data region safe to read. Consumes the
/// posted receive; a further cycle needs a fresh [`post_notify_receive`].
pub async fn await_notification(
    conn: &mut Connection,
    posted: PostedNotify,
    timeout: Duration,
) -> Result<()> {
    let wc = conn.cq_mut().wait_one(timeout).await?;
    dispatch(WrTag::ExpectReceive, wc.wr_id)?;
    conn.cq_mut().ack_events(1);
    posted.notify_mr.deregister().map_err(|(_, e)| e)?;
    tracing::debug!("notification observed, buffer is readable");
    Ok(())
}

/// Passive side, steps 1+2 fused for loops that also need to notice the
/// peer disconnecting: returns `None` on disconnect, `Some(())` once the
/// notification lands.
pub async fn await_notification_or_disconnect(
    conn: &mut Connection,
    posted: PostedNotify,
    timeout: Duration,
) -> Result<Option<()>> {
    match conn.completion_or_disconnect(timeout).await? {
        CycleEvent::Disconnected => {
            // Abandoned cycle: the posted receive is flushed with the
            // connection; drop releases the notify region and the data pin.
            drop(posted);
            Ok(None)
        }
        CycleEvent::Completion(wc) => {
            dispatch(WrTag::ExpectReceive, wc.wr_id)?;
            conn.cq_mut().ack_events(1);
            posted.notify_mr.deregister().map_err(|(_, e)| e)?;
            Ok(Some(()))
        }
    }
}

/// Active side: the full write-then-notify sequence.
///
/// Issues the signaled one-sided write of `payload[..len]` at the peer's
/// region, waits for its completion, then sends the notification and waits
/// for that completion too. Both waits are bounded by `timeout`; an elapsed
/// bound surfaces as `NotificationTimeout` and is not retried.
pub async fn push_and_notify(
    conn: &mut Connection,
    payload: &MemoryRegion,
    len: usize,
    remote: &RemoteBufferDescriptor,
    timeout: Duration,
) -> Result<()> {
    conn.qp().post_write(
        WrTag::ExpectWriteCompletion.wr_id(),
        payload,
        len,
        remote,
        true,
    )?;
    let wc = conn.cq_mut().wait_one(timeout).await?;
    dispatch(WrTag::ExpectWriteCompletion, wc.wr_id)?;
    tracing::debug!(bytes = wc.byte_len, "one-sided write completed");

    // The notification rides a dedicated tiny region; its payload is
    // irrelevant, its arrival is the signal.
    let notify_mr = conn
        .pd()
        .register(vec![0u8; NOTIFY_REGION_LEN], AccessRights::LocalWrite)?;
    conn.qp().post_send(
        WrTag::ExpectSendCompletion.wr_id(),
        &notify_mr,
        NOTIFY_REGION_LEN,
        true,
    )?;
    let wc = conn.cq_mut().wait_one(timeout).await?;
    dispatch(WrTag::ExpectSendCompletion, wc.wr_id)?;
    notify_mr.deregister().map_err(|(_, e)| e)?;

    // Both channel events acknowledged in one batch.
    conn.cq_mut().ack_events(2);
    tracing::debug!("write-notify sequence complete");
    Ok(())
}

/// The single completion-dispatch point: maps a drained completion back to
/// the operation kind the protocol step was waiting on.
fn dispatch(expected: WrTag, wr_id: u64) -> Result<()> {
    match WrTag::from_wr_id(wr_id) {
        Some(tag) if tag == expected => Ok(()),
        _ => Err(RdmaError::UnexpectedCompletion {
            expected,
            actual: wr_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_accepts_only_the_expected_tag() {
        assert!(dispatch(WrTag::ExpectWriteCompletion, 1).is_ok());
        let err = dispatch(WrTag::ExpectWriteCompletion, 0).unwrap_err();
        assert!(matches!(
            err,
            RdmaError::UnexpectedCompletion {
                expected: WrTag::ExpectWriteCompletion,
                actual: 0
            }
        ));
        assert!(dispatch(WrTag::ExpectReceive, 99).is_err());
    }
}
