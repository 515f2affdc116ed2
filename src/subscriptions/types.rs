//! Subscription lifecycle types.

use crate::config::SubscriptionOptions;
use crate::native::RawHandle;
use crate::types::SubscriptionId;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a subscription.
///
/// `Registering -> Active -> Unregistering -> Unregistered`, with
/// `Active -> Expired` when the server drops the registration on its own
/// (timeout) and `Active -> Unregistered` on connection teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Registering,
    Active,
    Unregistering,
    /// Gone on the server; the local handle is released by `unregister`.
    Expired,
    Unregistered,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Registering => "registering",
            SubscriptionState::Active => "active",
            SubscriptionState::Unregistering => "unregistering",
            SubscriptionState::Expired => "expired",
            SubscriptionState::Unregistered => "unregistered",
        };
        f.write_str(s)
    }
}

/// Token returned by a successful registration.
///
/// Valid until the subscription is unregistered or its connection is
/// released. A handle from an earlier registration of the same identifier
/// is rejected, never mistaken for the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    pub(crate) id: SubscriptionId,
    pub(crate) raw: RawHandle,
    pub(crate) generation: u64,
}

impl RegistrationHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Native subscription handle. Never null.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

/// Point-in-time view of a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub state: SubscriptionState,
    pub options: SubscriptionOptions,
    /// Statements bound to this subscription.
    pub statements: usize,
    /// Time since registration.
    pub age: Duration,
}
