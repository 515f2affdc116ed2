//! In-memory native client.
//!
//! [`SimulatedClient`] implements [`NativeClient`] over a handle table kept
//! in memory. It plays the part of the client library and the database
//! server at once: it hands out connection handle sets, accepts
//! registrations, builds change descriptors and delivers them to the
//! registered callback. Faults can be injected at every primitive, which is
//! how the failure paths of registration and binding are exercised.
//! Calls can also be parked at a primitive with [`SimulatedClient::hold`]
//! to open race windows deterministically.
//!
//! Compiled for unit tests and behind the `sim` feature.

use crate::native::{
    AttrValue, Attribute, ConnectionContext, ErrorRecord, HandleKind, NativeClient, NotifyCallback,
    RawHandle, Status, NAMESPACE_DBCHANGE,
};
use crate::types::{EventKind, OperationMask};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Error code reported for injected `Error` faults.
pub const SIMULATED_ERROR_CODE: i32 = 20001;

/// Error code reported when unregistering an unknown registration.
pub const UNKNOWN_REGISTRATION_CODE: i32 = 29970;

/// Where an injected fault fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Alloc(HandleKind),
    AttrSet(Attribute),
    Register,
    Unregister,
    Execute,
}

/// Row detail of a simulated table change.
#[derive(Clone, Debug)]
enum RowSpec {
    Rows(Vec<(String, OperationMask)>),
    Null,
    Dangling,
}

/// One table of a simulated object-change descriptor.
#[derive(Clone, Debug)]
pub struct TableSpec {
    name: String,
    operations: OperationMask,
    rows: RowSpec,
}

impl TableSpec {
    /// A table change carrying the given rowids, in order.
    pub fn rows(name: impl Into<String>, operations: OperationMask, rowids: &[&str]) -> Self {
        Self {
            name: name.into(),
            operations,
            rows: RowSpec::Rows(
                rowids
                    .iter()
                    .map(|r| (r.to_string(), operations))
                    .collect(),
            ),
        }
    }

    /// A change the server rolled up to the whole table.
    pub fn rollup(name: impl Into<String>, operations: OperationMask) -> Self {
        Self {
            name: name.into(),
            operations: operations | OperationMask::ALL_ROWS,
            rows: RowSpec::Null,
        }
    }

    /// A change whose row collection is null.
    pub fn without_rows(name: impl Into<String>, operations: OperationMask) -> Self {
        Self {
            name: name.into(),
            operations,
            rows: RowSpec::Null,
        }
    }

    /// A change whose row collection handle is invalid.
    pub fn broken(name: impl Into<String>, operations: OperationMask) -> Self {
        Self {
            name: name.into(),
            operations,
            rows: RowSpec::Dangling,
        }
    }
}

struct Object {
    kind: HandleKind,
    attrs: HashMap<Attribute, AttrValue>,
    elements: Vec<RawHandle>,
    registered: bool,
    executions: u32,
    sql: Option<String>,
}

impl Object {
    fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            attrs: HashMap::new(),
            elements: Vec::new(),
            registered: false,
            executions: 0,
            sql: None,
        }
    }
}

#[derive(Default)]
struct State {
    next_handle: u64,
    objects: HashMap<RawHandle, Object>,
    errors: HashMap<RawHandle, Vec<ErrorRecord>>,
    faults: HashMap<FaultPoint, Status>,
    register_calls: u64,
    unregister_calls: u64,
}

impl State {
    fn insert(&mut self, object: Object) -> RawHandle {
        self.next_handle += 1;
        let handle = RawHandle(self.next_handle);
        self.objects.insert(handle, object);
        handle
    }

    fn collection(&mut self, elements: Vec<RawHandle>) -> RawHandle {
        let mut object = Object::new(HandleKind::Collection);
        object.elements = elements;
        self.insert(object)
    }

    fn descriptor(&mut self, kind: HandleKind, attrs: Vec<(Attribute, AttrValue)>) -> RawHandle {
        let mut object = Object::new(kind);
        object.attrs.extend(attrs);
        self.insert(object)
    }

    /// Status of an injected fault, recording diagnostics on `err`.
    fn fault(&mut self, point: FaultPoint, err: RawHandle) -> Option<Status> {
        let status = *self.faults.get(&point)?;
        if status == Status::Error {
            self.fail(err, SIMULATED_ERROR_CODE, format!("simulated {:?} failure", point));
        }
        Some(status)
    }

    fn fail(&mut self, err: RawHandle, code: i32, message: String) {
        self.errors.insert(err, vec![ErrorRecord { code, message }]);
    }

    fn is(&self, handle: RawHandle, kind: HandleKind) -> bool {
        self.objects.get(&handle).map_or(false, |o| o.kind == kind)
    }
}

/// Parks the next call at a [`FaultPoint`] until released.
///
/// Dropping the hold releases a parked call.
pub struct Hold {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl Hold {
    /// Wait until a call has reached the held point.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    /// Let the parked call continue.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// In-memory implementation of the native client library.
#[derive(Default)]
pub struct SimulatedClient {
    state: Mutex<State>,
    gates: Mutex<HashMap<FaultPoint, Gate>>,
}

impl SimulatedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a simulated session and return its handle set.
    pub fn connect(&self) -> ConnectionContext {
        let mut state = self.state.lock();
        ConnectionContext {
            env: state.insert(Object::new(HandleKind::Environment)),
            error: state.insert(Object::new(HandleKind::Error)),
            service: state.insert(Object::new(HandleKind::ServiceContext)),
            session: state.insert(Object::new(HandleKind::Session)),
        }
    }

    /// Prepare a statement on a session.
    pub fn prepare(&self, _ctx: &ConnectionContext, sql: &str) -> RawHandle {
        let mut state = self.state.lock();
        let mut object = Object::new(HandleKind::Statement);
        object.sql = Some(sql.to_string());
        state.insert(object)
    }

    // --- Fault injection ---

    /// Make every call at `point` fail with `status` until cleared.
    pub fn inject(&self, point: FaultPoint, status: Status) {
        self.state.lock().faults.insert(point, status);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Park the next call at `point` (attribute set or register only)
    /// before it touches any state.
    pub fn hold(&self, point: FaultPoint) -> Hold {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        self.gates.lock().insert(
            point,
            Gate {
                entered: entered_tx,
                release: release_rx,
            },
        );
        Hold {
            entered: entered_rx,
            release: release_tx,
        }
    }

    fn pass(&self, point: FaultPoint) {
        let gate = self.gates.lock().remove(&point);
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
    }

    // --- Introspection ---

    /// Number of live handles of `kind`.
    pub fn allocated(&self, kind: HandleKind) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind == kind)
            .count()
    }

    /// Number of subscriptions currently registered with the "server".
    pub fn registered_subscriptions(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind == HandleKind::Subscription && o.registered)
            .count()
    }

    pub fn is_registered(&self, subscription: RawHandle) -> bool {
        self.state
            .lock()
            .objects
            .get(&subscription)
            .map_or(false, |o| o.registered)
    }

    pub fn attr(&self, handle: RawHandle, attr: Attribute) -> Option<AttrValue> {
        self.state
            .lock()
            .objects
            .get(&handle)
            .and_then(|o| o.attrs.get(&attr).cloned())
    }

    pub fn executions(&self, statement: RawHandle) -> u32 {
        self.state
            .lock()
            .objects
            .get(&statement)
            .map_or(0, |o| o.executions)
    }

    pub fn sql(&self, statement: RawHandle) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(&statement)
            .and_then(|o| o.sql.clone())
    }

    pub fn register_calls(&self) -> u64 {
        self.state.lock().register_calls
    }

    pub fn unregister_calls(&self) -> u64 {
        self.state.lock().unregister_calls
    }

    // --- Server side ---

    /// Build a descriptor for a database-level event.
    pub fn event_descriptor(&self, kind: EventKind, database: Option<&str>) -> RawHandle {
        self.raw_event_descriptor(kind.as_raw(), database)
    }

    /// Build a descriptor with an arbitrary notification type.
    pub fn raw_event_descriptor(&self, notify_type: u32, database: Option<&str>) -> RawHandle {
        let mut state = self.state.lock();
        let mut attrs = vec![
            (Attribute::ChdesNotifyType, AttrValue::U32(notify_type)),
            (Attribute::ChdesTableChanges, AttrValue::Collection(None)),
        ];
        if let Some(db) = database {
            attrs.push((Attribute::ChdesDbName, AttrValue::Text(db.to_string())));
        }
        state.descriptor(HandleKind::ChangeDescriptor, attrs)
    }

    /// Build an object-change descriptor with tables in the given order.
    pub fn change_descriptor(&self, database: Option<&str>, tables: &[TableSpec]) -> RawHandle {
        let mut state = self.state.lock();
        let mut table_handles = Vec::with_capacity(tables.len());
        for table in tables {
            let rows = match &table.rows {
                RowSpec::Rows(rows) => {
                    let row_handles = rows
                        .iter()
                        .map(|(rowid, ops)| {
                            state.descriptor(
                                HandleKind::RowChangeDescriptor,
                                vec![
                                    (
                                        Attribute::ChdesRowRowid,
                                        AttrValue::Bytes(rowid.as_bytes().to_vec()),
                                    ),
                                    (Attribute::ChdesRowOpFlags, AttrValue::U32(ops.bits())),
                                ],
                            )
                        })
                        .collect();
                    AttrValue::Collection(Some(state.collection(row_handles)))
                }
                RowSpec::Null => AttrValue::Collection(None),
                RowSpec::Dangling => AttrValue::Collection(Some(RawHandle(u64::MAX))),
            };
            let handle = state.descriptor(
                HandleKind::TableChangeDescriptor,
                vec![
                    (Attribute::ChdesTableName, AttrValue::Text(table.name.clone())),
                    (
                        Attribute::ChdesTableOpFlags,
                        AttrValue::U32(table.operations.bits()),
                    ),
                    (Attribute::ChdesTableRowChanges, rows),
                ],
            );
            table_handles.push(handle);
        }
        let tables = state.collection(table_handles);
        let mut attrs = vec![
            (
                Attribute::ChdesNotifyType,
                AttrValue::U32(EventKind::ObjectChanged.as_raw()),
            ),
            (Attribute::ChdesTableChanges, AttrValue::Collection(Some(tables))),
        ];
        if let Some(db) = database {
            attrs.push((Attribute::ChdesDbName, AttrValue::Text(db.to_string())));
        }
        state.descriptor(HandleKind::ChangeDescriptor, attrs)
    }

    /// Callback and context installed on a registered subscription.
    pub fn callback(&self, subscription: RawHandle) -> Option<(u64, NotifyCallback)> {
        let state = self.state.lock();
        let object = state.objects.get(&subscription)?;
        if !object.registered {
            return None;
        }
        let callback = object.attrs.get(&Attribute::SubscrCallback)?.as_callback()?.clone();
        let context = object.attrs.get(&Attribute::SubscrContext)?.as_u64()?;
        Some((context, callback))
    }

    /// Deliver a descriptor to a registered subscription on the calling
    /// thread. Returns false if nothing is registered to receive it.
    pub fn notify(&self, subscription: RawHandle, descriptor: RawHandle) -> bool {
        // Lock released before the callback re-enters the client.
        let Some((context, callback)) = self.callback(subscription) else {
            return false;
        };
        callback(context, descriptor);
        true
    }
}

impl NativeClient for SimulatedClient {
    fn handle_alloc(&self, env: RawHandle, kind: HandleKind) -> Result<RawHandle, Status> {
        let mut state = self.state.lock();
        if let Some(status) = state.fault(FaultPoint::Alloc(kind), RawHandle::NULL) {
            return Err(status);
        }
        if !state.is(env, HandleKind::Environment) {
            return Err(Status::InvalidHandle);
        }
        Ok(state.insert(Object::new(kind)))
    }

    fn handle_free(&self, handle: RawHandle, kind: HandleKind) -> Status {
        let mut state = self.state.lock();
        if !state.is(handle, kind) {
            return Status::InvalidHandle;
        }
        state.objects.remove(&handle);
        state.errors.remove(&handle);
        Status::Success
    }

    fn attr_set(
        &self,
        target: RawHandle,
        kind: HandleKind,
        attr: Attribute,
        value: AttrValue,
        err: RawHandle,
    ) -> Status {
        self.pass(FaultPoint::AttrSet(attr));
        let mut state = self.state.lock();
        if let Some(status) = state.fault(FaultPoint::AttrSet(attr), err) {
            return status;
        }
        if !state.is(target, kind) {
            return Status::InvalidHandle;
        }
        if attr == Attribute::ChnfRegHandle {
            let valid = value
                .as_handle()
                .and_then(|h| state.objects.get(&h))
                .map_or(false, |o| o.kind == HandleKind::Subscription && o.registered);
            if !valid {
                return Status::InvalidHandle;
            }
        }
        if let Some(object) = state.objects.get_mut(&target) {
            object.attrs.insert(attr, value);
        }
        Status::Success
    }

    fn attr_get(
        &self,
        target: RawHandle,
        kind: HandleKind,
        attr: Attribute,
        err: RawHandle,
    ) -> Result<AttrValue, Status> {
        let mut state = self.state.lock();
        if !state.is(target, kind) {
            return Err(Status::InvalidHandle);
        }
        let value = state
            .objects
            .get(&target)
            .and_then(|o| o.attrs.get(&attr).cloned());
        match value {
            Some(value) => Ok(value),
            None => {
                state.fail(err, 24315, format!("illegal attribute {}", attr));
                Err(Status::Error)
            }
        }
    }

    fn coll_size(&self, _env: RawHandle, _err: RawHandle, coll: RawHandle) -> Result<u32, Status> {
        let state = self.state.lock();
        match state.objects.get(&coll) {
            Some(o) if o.kind == HandleKind::Collection => Ok(o.elements.len() as u32),
            _ => Err(Status::InvalidHandle),
        }
    }

    fn coll_get_elem(
        &self,
        _env: RawHandle,
        _err: RawHandle,
        coll: RawHandle,
        index: u32,
    ) -> Result<Option<RawHandle>, Status> {
        let state = self.state.lock();
        match state.objects.get(&coll) {
            Some(o) if o.kind == HandleKind::Collection => {
                Ok(o.elements.get(index as usize).copied())
            }
            _ => Err(Status::InvalidHandle),
        }
    }

    fn stmt_execute(&self, svc: RawHandle, stmt: RawHandle, err: RawHandle, _iters: u32) -> Status {
        let mut state = self.state.lock();
        if let Some(status) = state.fault(FaultPoint::Execute, err) {
            return status;
        }
        if !state.is(svc, HandleKind::ServiceContext) {
            return Status::InvalidHandle;
        }
        match state.objects.get_mut(&stmt) {
            Some(o) if o.kind == HandleKind::Statement => {
                o.executions += 1;
                Status::Success
            }
            _ => Status::InvalidHandle,
        }
    }

    fn subscription_register(&self, svc: RawHandle, sub: RawHandle, err: RawHandle) -> Status {
        self.pass(FaultPoint::Register);
        let mut state = self.state.lock();
        state.register_calls += 1;
        if let Some(status) = state.fault(FaultPoint::Register, err) {
            return status;
        }
        if !state.is(svc, HandleKind::ServiceContext) || !state.is(sub, HandleKind::Subscription) {
            return Status::InvalidHandle;
        }
        let namespace = state
            .objects
            .get(&sub)
            .and_then(|o| o.attrs.get(&Attribute::SubscrNamespace))
            .and_then(AttrValue::as_u32);
        if namespace != Some(NAMESPACE_DBCHANGE) {
            state.fail(err, 24904, "subscription namespace not set".into());
            return Status::Error;
        }
        if let Some(object) = state.objects.get_mut(&sub) {
            object.registered = true;
        }
        Status::Success
    }

    fn subscription_unregister(&self, svc: RawHandle, sub: RawHandle, err: RawHandle) -> Status {
        let mut state = self.state.lock();
        state.unregister_calls += 1;
        if let Some(status) = state.fault(FaultPoint::Unregister, err) {
            return status;
        }
        if !state.is(svc, HandleKind::ServiceContext) || !state.is(sub, HandleKind::Subscription) {
            return Status::InvalidHandle;
        }
        let registered = state.objects.get(&sub).map_or(false, |o| o.registered);
        if !registered {
            state.fail(
                err,
                UNKNOWN_REGISTRATION_CODE,
                "Specified registration id does not exist".into(),
            );
            return Status::Error;
        }
        if let Some(object) = state.objects.get_mut(&sub) {
            object.registered = false;
        }
        Status::Success
    }

    fn error_get(&self, err: RawHandle, record: u32) -> Option<ErrorRecord> {
        let index = usize::try_from(record).ok()?.checked_sub(1)?;
        self.state.lock().errors.get(&err)?.get(index).cloned()
    }
}
