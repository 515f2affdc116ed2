//! Host-side notification handlers.

use crate::types::{EventKind, NotificationEvent, RowId, SubscriptionId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Error returned by a host handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a host handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

/// Receives decoded notifications for one subscription.
///
/// Called synchronously on the thread that delivered the notification, which
/// belongs to the client library. Calls may run concurrently. Errors and
/// panics are contained by the dispatcher and never reach the native
/// thread.
pub trait NotificationHandler: Send + Sync + 'static {
    fn on_notification(&self, id: SubscriptionId, event: &NotificationEvent) -> HandlerResult;
}

/// Adapter that wraps a closure into a [`NotificationHandler`].
pub struct FnHandler<F>(F);

impl<F> NotificationHandler for FnHandler<F>
where
    F: Fn(SubscriptionId, &NotificationEvent) -> HandlerResult + Send + Sync + 'static,
{
    fn on_notification(&self, id: SubscriptionId, event: &NotificationEvent) -> HandlerResult {
        (self.0)(id, event)
    }
}

/// Build a handler from a closure.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(SubscriptionId, &NotificationEvent) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler(f)
}

/// Flat callback shape for hosts that cannot take structured events.
///
/// `table_name` is empty for non-object events. `row_ids` is empty and
/// `row_count` is -1 when the event has no row-level data, which keeps a
/// rolled-up change distinct from a change of zero rows.
pub trait HostCallback: Send + Sync + 'static {
    fn on_notification(
        &self,
        id: SubscriptionId,
        event_type: EventKind,
        table_name: &str,
        row_ids: &[RowId],
        row_count: i64,
    ) -> HandlerResult;
}

/// Adapts a [`HostCallback`] to [`NotificationHandler`].
pub struct FlatHandler<C>(pub C);

impl<C: HostCallback> NotificationHandler for FlatHandler<C> {
    fn on_notification(&self, id: SubscriptionId, event: &NotificationEvent) -> HandlerResult {
        let row_ids: Vec<RowId> = event.rowids().copied().collect();
        self.0
            .on_notification(id, event.kind, event.table_name(), &row_ids, event.row_count())
    }
}

/// An event received through a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub subscription: SubscriptionId,
    pub event: NotificationEvent,
}

/// Forwards events into a bounded channel without blocking.
///
/// When the receiver falls behind the event is dropped and counted; the
/// notification thread is never held up by a slow consumer.
pub struct ChannelHandler {
    sender: Sender<Delivered>,
    dropped: Arc<AtomicU64>,
    /// Dispatcher-wide drop counter, if any.
    total: Option<Arc<AtomicU64>>,
}

impl ChannelHandler {
    pub fn bounded(capacity: usize) -> (Self, EventReceiver) {
        Self::build(capacity, None)
    }

    /// Like [`ChannelHandler::bounded`], also counting drops into `total`.
    pub(crate) fn bounded_counted(capacity: usize, total: Arc<AtomicU64>) -> (Self, EventReceiver) {
        Self::build(capacity, Some(total))
    }

    fn build(capacity: usize, total: Option<Arc<AtomicU64>>) -> (Self, EventReceiver) {
        let (sender, receiver) = bounded(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Self {
                sender,
                dropped: Arc::clone(&dropped),
                total,
            },
            EventReceiver { receiver, dropped },
        )
    }

    fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(total) = &self.total {
            total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl NotificationHandler for ChannelHandler {
    fn on_notification(&self, id: SubscriptionId, event: &NotificationEvent) -> HandlerResult {
        let delivered = Delivered {
            subscription: id,
            event: event.clone(),
        };
        match self.sender.try_send(delivered) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(d)) => {
                self.count_drop();
                Err(format!("event channel full, dropped {} event", d.event.kind).into())
            }
            Err(TrySendError::Disconnected(_)) => {
                self.count_drop();
                Err("event receiver dropped".into())
            }
        }
    }
}

/// Receiving side of a [`ChannelHandler`].
pub struct EventReceiver {
    receiver: Receiver<Delivered>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<Delivered, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<Delivered, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivered, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &Receiver<Delivered> {
        &self.receiver
    }
}
