//! Event dispatch.
//!
//! The native layer calls back on its own threads with an opaque context
//! (the subscription identifier) and a change descriptor. The [`Dispatcher`]
//! resolves the identifier to the registered handler, decodes the
//! descriptor and invokes the handler once per event, containing any
//! failure.
//!
//! Handlers come in three shapes:
//!
//! - [`NotificationHandler`] receives structured [`NotificationEvent`]s
//! - [`HostCallback`] receives the flat `(id, type, table, rowids, count)`
//!   tuple, adapted by [`FlatHandler`]
//! - [`ChannelHandler`] forwards events into a bounded channel for hosts
//!   that consume on their own threads
//!
//! [`NotificationEvent`]: crate::types::NotificationEvent

mod dispatcher;
mod handler;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use handler::{
    handler_fn, ChannelHandler, Delivered, EventReceiver, FlatHandler, FnHandler, HandlerError,
    HandlerResult, HostCallback, NotificationHandler,
};
