//! # Database Change Notification
//!
//! Subscribes to server-side change notifications for the tables read by
//! selected queries and delivers decoded events to host handlers.
//!
//! ## Core Concepts
//!
//! - **Registry**: subscriptions registered in the database-change
//!   namespace, keyed by a caller-chosen identifier
//! - **Binder**: attaches prepared statements to a subscription; executing
//!   them registers the objects they read
//! - **Decoder**: walks native change descriptors into typed events
//! - **Dispatcher**: routes notifications from client-library threads to
//!   the right handler without letting failures escape
//!
//! ## Example
//!
//! ```ignore
//! use dbchange::{ChangeNotifier, OperationMask, SubscriptionId, SubscriptionOptions};
//! use std::time::Duration;
//!
//! let notifier = ChangeNotifier::new(client);
//! let options = SubscriptionOptions::default()
//!     .with_operations(OperationMask::UPDATE | OperationMask::DELETE)
//!     .with_rowids(true)
//!     .with_timeout(Duration::from_secs(1800));
//!
//! let (handle, events) = notifier.register_with_channel(&ctx, SubscriptionId(42), &options)?;
//! notifier.register_query(&handle, statement)?;
//!
//! while let Ok(delivered) = events.recv() {
//!     println!("{} changed", delivered.event.table_name());
//! }
//! ```

pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod native;
pub mod notifier;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::{NotifierConfig, Protocol, SubscriptionOptions, Transport};
pub use decoder::{DecodeOptions, DecodedNotification, NotificationDecoder};
pub use dispatch::{
    handler_fn, ChannelHandler, Delivered, DispatchStats, Dispatcher, EventReceiver, FlatHandler,
    HandlerError, HandlerResult, HostCallback, NotificationHandler,
};
pub use error::{NotifyError, Result};
pub use native::{ConnectionContext, NativeClient, RawHandle, Status};
pub use notifier::ChangeNotifier;
pub use subscriptions::{
    RegistrationHandle, SubscriptionInfo, SubscriptionRegistry, SubscriptionState,
};
pub use types::*;
