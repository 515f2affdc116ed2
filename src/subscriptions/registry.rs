//! Registry of active subscriptions.

use crate::config::{SubscriptionOptions, Transport};
use crate::dispatch::NotificationHandler;
use crate::error::{NotifyError, Result};
use crate::native::{
    check, AttrValue, Attribute, ConnectionContext, HandleKind, NativeClient, NotifyCallback,
    RawHandle, ScopedHandle, NAMESPACE_DBCHANGE,
};
use crate::types::SubscriptionId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::types::{RegistrationHandle, SubscriptionInfo, SubscriptionState};

/// Internal subscription state.
pub(super) struct Entry {
    pub(super) generation: u64,
    pub(super) raw: RawHandle,
    pub(super) connection: ConnectionContext,
    options: SubscriptionOptions,
    pub(super) state: SubscriptionState,
    handler: Arc<dyn NotificationHandler>,
    pub(super) statements: Vec<RawHandle>,
    registered_at: Instant,
}

#[derive(Default)]
pub(super) struct Tables {
    pub(super) entries: HashMap<SubscriptionId, Entry>,
    /// Identifiers whose registration is in flight -> their service context.
    pending: HashMap<SubscriptionId, RawHandle>,
    /// In-flight registrations whose connection was released meanwhile.
    cancelled: HashSet<SubscriptionId>,
    /// Bound statement -> owning subscription.
    pub(super) statements: HashMap<RawHandle, SubscriptionId>,
    /// Statements whose bind is in flight -> subscription binding them.
    pub(super) binding: HashMap<RawHandle, SubscriptionId>,
}

impl Tables {
    /// The entry `handle` refers to, if it is still the active registration.
    pub(super) fn active(&self, handle: &RegistrationHandle) -> Result<&Entry> {
        match self.entries.get(&handle.id) {
            Some(entry)
                if entry.generation == handle.generation
                    && entry.state == SubscriptionState::Active =>
            {
                Ok(entry)
            }
            _ => Err(NotifyError::StaleHandle(handle.id)),
        }
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        for statement in &entry.statements {
            if self.statements.get(statement) == Some(&id) {
                self.statements.remove(statement);
            }
        }
        Some(entry)
    }
}

/// What the dispatcher needs to deliver one notification.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) handler: Arc<dyn NotificationHandler>,
    pub(crate) env: RawHandle,
    pub(crate) rowids: bool,
}

/// Tracks subscriptions by identifier.
///
/// Registration and unregistration take the write lock only around table
/// updates; native round-trips run without it. Lookups from notification
/// threads take the read lock and never call a handler while holding it.
pub struct SubscriptionRegistry {
    client: Arc<dyn NativeClient>,
    pub(super) tables: RwLock<Tables>,
    next_generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(client: Arc<dyn NativeClient>) -> Self {
        Self {
            client,
            tables: RwLock::new(Tables::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> &Arc<dyn NativeClient> {
        &self.client
    }

    /// Register a subscription in the database-change namespace.
    ///
    /// `callback` is installed on the native subscription when the transport
    /// is in-process; the native layer calls it with `id` as context. On any
    /// failure the subscription handle is released before returning.
    pub fn register(
        &self,
        ctx: &ConnectionContext,
        id: SubscriptionId,
        options: &SubscriptionOptions,
        handler: Arc<dyn NotificationHandler>,
        callback: NotifyCallback,
    ) -> Result<RegistrationHandle> {
        options.validate()?;
        {
            let mut tables = self.tables.write();
            if tables.entries.contains_key(&id) || tables.pending.contains_key(&id) {
                return Err(NotifyError::DuplicateSubscription(id));
            }
            tables.pending.insert(id, ctx.service);
        }

        debug!(subscription = %id, ?options, "registering subscription");
        let result = self.register_native(ctx, id, options, callback);

        let mut tables = self.tables.write();
        tables.pending.remove(&id);
        let cancelled = tables.cancelled.remove(&id);
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!(subscription = %id, error = %e, "subscription registration failed");
                return Err(e);
            }
        };
        if cancelled {
            drop(tables);
            drop(ScopedHandle::adopt(self.client.as_ref(), raw, HandleKind::Subscription));
            warn!(subscription = %id, "connection released during registration");
            return Err(NotifyError::ConnectionReleased(id));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        tables.entries.insert(
            id,
            Entry {
                generation,
                raw,
                connection: *ctx,
                options: options.clone(),
                state: SubscriptionState::Active,
                handler,
                statements: Vec::new(),
                registered_at: Instant::now(),
            },
        );
        info!(subscription = %id, handle = ?raw, "subscription registered");

        Ok(RegistrationHandle { id, raw, generation })
    }

    /// Allocate, configure and register the native subscription.
    ///
    /// Attribute attachment is not atomic. If the process dies between
    /// allocation and registration the handle is orphaned.
    fn register_native(
        &self,
        ctx: &ConnectionContext,
        id: SubscriptionId,
        options: &SubscriptionOptions,
        callback: NotifyCallback,
    ) -> Result<RawHandle> {
        let client = self.client.as_ref();
        let sub = ScopedHandle::alloc(client, ctx.env, HandleKind::Subscription)?;
        let handle = sub.handle();
        let set = |attr: Attribute, value: AttrValue| {
            self.set_attr(handle, HandleKind::Subscription, attr, value, ctx.error)
        };

        set(Attribute::SubscrNamespace, AttrValue::U32(NAMESPACE_DBCHANGE))?;
        match &options.transport {
            Transport::InProcess => set(Attribute::SubscrCallback, AttrValue::Callback(callback))?,
            Transport::Remote { protocol, endpoint } => {
                set(
                    Attribute::SubscrRecipientProtocol,
                    AttrValue::U32(protocol.as_raw()),
                )?;
                set(Attribute::SubscrRecipient, AttrValue::Text(endpoint.clone()))?;
            }
        }
        set(Attribute::SubscrContext, AttrValue::U64(id.0))?;
        if let Some(name) = &options.name {
            set(Attribute::SubscrName, AttrValue::Text(name.clone()))?;
        }
        if let Some(port) = options.port {
            set(Attribute::SubscrPort, AttrValue::U32(u32::from(port)))?;
        }
        set(Attribute::ChnfRowids, AttrValue::Bool(options.rowids))?;
        set(
            Attribute::ChnfOperations,
            AttrValue::U32(options.operations.effective().bits()),
        )?;
        set(Attribute::SubscrTimeout, AttrValue::U32(options.timeout_secs))?;

        let status = client.subscription_register(ctx.service, handle, ctx.error);
        check(client, ctx.error, status, "subscription register")?;

        Ok(sub.into_raw())
    }

    pub(super) fn set_attr(
        &self,
        target: RawHandle,
        kind: HandleKind,
        attr: Attribute,
        value: AttrValue,
        err: RawHandle,
    ) -> Result<()> {
        let status = self.client.attr_set(target, kind, attr, value, err);
        check(self.client.as_ref(), err, status, attr.name())
    }

    /// Unregister and release a subscription.
    ///
    /// A handle is accepted once: later calls fail with `StaleHandle`
    /// without reaching the native layer. If the native unregister fails the
    /// subscription stays active and the call may be retried.
    pub fn unregister(&self, handle: &RegistrationHandle) -> Result<()> {
        let (connection, expired) = {
            let mut tables = self.tables.write();
            let entry = match tables.entries.get_mut(&handle.id) {
                Some(entry) if entry.generation == handle.generation => entry,
                _ => return Err(NotifyError::StaleHandle(handle.id)),
            };
            let expired = match entry.state {
                SubscriptionState::Active => false,
                SubscriptionState::Expired => true,
                _ => return Err(NotifyError::StaleHandle(handle.id)),
            };
            entry.state = SubscriptionState::Unregistering;
            (entry.connection, expired)
        };

        let client = self.client.as_ref();
        if !expired {
            let status = client.subscription_unregister(connection.service, handle.raw, connection.error);
            if let Err(e) = check(client, connection.error, status, "subscription unregister") {
                let mut tables = self.tables.write();
                if let Some(entry) = tables.entries.get_mut(&handle.id) {
                    if entry.generation == handle.generation {
                        entry.state = SubscriptionState::Active;
                    }
                }
                warn!(subscription = %handle.id, error = %e, "unregister failed");
                return Err(e);
            }
        }

        self.tables.write().remove(handle.id);
        drop(ScopedHandle::adopt(client, handle.raw, HandleKind::Subscription));
        info!(subscription = %handle.id, expired, "subscription unregistered");
        Ok(())
    }

    /// Record that the server dropped the registration (timeout).
    ///
    /// Returns false if the subscription was not active.
    pub fn mark_expired(&self, id: SubscriptionId) -> bool {
        let mut tables = self.tables.write();
        match tables.entries.get_mut(&id) {
            Some(entry) if entry.state == SubscriptionState::Active => {
                entry.state = SubscriptionState::Expired;
                info!(subscription = %id, "subscription removed by server");
                true
            }
            _ => false,
        }
    }

    /// Forget every subscription of a connection that is being torn down.
    ///
    /// The server drops registrations with the session, so no native
    /// unregister is issued; local handles are freed. Registrations still in
    /// flight on the connection fail with `ConnectionReleased` once the
    /// native call returns. Returns the number of subscriptions released.
    pub fn release_connection(&self, ctx: &ConnectionContext) -> usize {
        let released: Vec<(SubscriptionId, RawHandle)> = {
            let mut tables = self.tables.write();
            let in_flight: Vec<SubscriptionId> = tables
                .pending
                .iter()
                .filter(|(_, service)| **service == ctx.service)
                .map(|(id, _)| *id)
                .collect();
            tables.cancelled.extend(in_flight);
            let ids: Vec<SubscriptionId> = tables
                .entries
                .iter()
                .filter(|(_, e)| {
                    e.connection.service == ctx.service
                        && e.state != SubscriptionState::Unregistering
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| tables.remove(id).map(|e| (id, e.raw)))
                .collect()
        };

        let client = self.client.as_ref();
        for (id, raw) in &released {
            drop(ScopedHandle::adopt(client, *raw, HandleKind::Subscription));
            debug!(subscription = %id, "released with connection");
        }
        if !released.is_empty() {
            info!(count = released.len(), "released subscriptions of closed connection");
        }
        released.len()
    }

    /// Delivery route for a subscription that may still receive events.
    pub(crate) fn route(&self, id: SubscriptionId) -> Option<Route> {
        let tables = self.tables.read();
        let entry = tables.entries.get(&id)?;
        match entry.state {
            SubscriptionState::Active | SubscriptionState::Unregistering => Some(Route {
                handler: Arc::clone(&entry.handler),
                env: entry.connection.env,
                rowids: entry.options.rowids,
            }),
            _ => None,
        }
    }

    pub fn state(&self, id: SubscriptionId) -> SubscriptionState {
        let tables = self.tables.read();
        if let Some(entry) = tables.entries.get(&id) {
            entry.state
        } else if tables.pending.contains_key(&id) {
            SubscriptionState::Registering
        } else {
            SubscriptionState::Unregistered
        }
    }

    pub fn info(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        let tables = self.tables.read();
        tables.entries.get(&id).map(|entry| SubscriptionInfo {
            id,
            state: entry.state,
            options: entry.options.clone(),
            statements: entry.statements.len(),
            age: entry.registered_at.elapsed(),
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.tables.read().entries.len()
    }

    pub fn ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.tables.read().entries.keys().copied().collect();
        ids.sort();
        ids
    }
}
