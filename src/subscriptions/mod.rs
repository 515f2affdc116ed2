//! Subscription registry and statement binding.
//!
//! A subscription is registered against a live connection in the
//! database-change namespace and keyed by a caller-chosen identifier. One or
//! more prepared statements are then bound to it; executing a bound
//! statement makes the server watch the objects it reads.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new(client);
//! let handle = registry.register(&ctx, SubscriptionId(42), &options, handler, callback)?;
//! registry.register_query(&handle, statement)?;
//! // ... notifications arrive ...
//! registry.unregister(&handle)?;
//! ```

mod binder;
mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{RegistrationHandle, SubscriptionInfo, SubscriptionState};
