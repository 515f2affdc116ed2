//! Contract with the native database client library.
//!
//! The client library owns connections, statement execution, collection
//! iteration and notification transport. This crate only consumes the
//! primitives listed on [`NativeClient`]:
//! - handle allocation and release
//! - attribute get/set on handles and change descriptors
//! - collection size and element access
//! - statement execution
//! - subscription register/unregister
//! - error-record retrieval for failed calls
//!
//! Every primitive reports a [`Status`]. Calls that produce a value return
//! `Err(status)` when they fail; the details of an `Error` status are read
//! back through [`NativeClient::error_get`].

mod handle;
mod status;

pub use handle::{ConnectionContext, RawHandle, ScopedHandle};
pub use status::{check, failure, Status};

use std::fmt;
use std::sync::Arc;

/// Namespace value for database object change registrations.
pub const NAMESPACE_DBCHANGE: u32 = 2;

/// Native callback installed on in-process subscriptions.
///
/// Invoked on a thread owned by the client library with the subscription
/// context and the raw change descriptor.
pub type NotifyCallback = Arc<dyn Fn(u64, RawHandle) + Send + Sync>;

/// Kind of a native handle, descriptor or collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Environment,
    Error,
    ServiceContext,
    Session,
    Statement,
    Subscription,
    ChangeDescriptor,
    TableChangeDescriptor,
    RowChangeDescriptor,
    Collection,
}

/// Attributes this crate reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    SubscrNamespace,
    SubscrCallback,
    SubscrContext,
    SubscrName,
    SubscrPort,
    SubscrTimeout,
    SubscrRecipientProtocol,
    SubscrRecipient,
    ChnfRowids,
    ChnfOperations,
    /// Statement attribute linking it to a subscription.
    ChnfRegHandle,
    ChdesNotifyType,
    ChdesDbName,
    ChdesTableChanges,
    ChdesTableName,
    ChdesTableOpFlags,
    ChdesTableRowChanges,
    ChdesRowRowid,
    ChdesRowOpFlags,
}

impl Attribute {
    pub fn name(self) -> &'static str {
        match self {
            Attribute::SubscrNamespace => "SUBSCR_NAMESPACE",
            Attribute::SubscrCallback => "SUBSCR_CALLBACK",
            Attribute::SubscrContext => "SUBSCR_CTX",
            Attribute::SubscrName => "SUBSCR_NAME",
            Attribute::SubscrPort => "SUBSCR_PORTNO",
            Attribute::SubscrTimeout => "SUBSCR_TIMEOUT",
            Attribute::SubscrRecipientProtocol => "SUBSCR_RECPTPROTO",
            Attribute::SubscrRecipient => "SUBSCR_RECPT",
            Attribute::ChnfRowids => "CHNF_ROWIDS",
            Attribute::ChnfOperations => "CHNF_OPERATIONS",
            Attribute::ChnfRegHandle => "CHNF_REGHANDLE",
            Attribute::ChdesNotifyType => "CHDES_NFYTYPE",
            Attribute::ChdesDbName => "CHDES_DBNAME",
            Attribute::ChdesTableChanges => "CHDES_TABLE_CHANGES",
            Attribute::ChdesTableName => "CHDES_TABLE_NAME",
            Attribute::ChdesTableOpFlags => "CHDES_TABLE_OPFLAGS",
            Attribute::ChdesTableRowChanges => "CHDES_TABLE_ROW_CHANGES",
            Attribute::ChdesRowRowid => "CHDES_ROW_ROWID",
            Attribute::ChdesRowOpFlags => "CHDES_ROW_OPFLAGS",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of an attribute.
#[derive(Clone)]
pub enum AttrValue {
    U32(u32),
    U64(u64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Handle(RawHandle),
    /// A collection attribute; `None` when the server sent no collection.
    Collection(Option<RawHandle>),
    Callback(NotifyCallback),
}

impl AttrValue {
    fn type_name(&self) -> &'static str {
        match self {
            AttrValue::U32(_) => "u32",
            AttrValue::U64(_) => "u64",
            AttrValue::Bool(_) => "bool",
            AttrValue::Text(_) => "text",
            AttrValue::Bytes(_) => "bytes",
            AttrValue::Handle(_) => "handle",
            AttrValue::Collection(_) => "collection",
            AttrValue::Callback(_) => "callback",
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            AttrValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::U64(v) => Some(*v),
            AttrValue::U32(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text or raw bytes, as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::Bytes(b) => Some(b),
            AttrValue::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<RawHandle> {
        match self {
            AttrValue::Handle(h) => Some(*h),
            _ => None,
        }
    }

    /// `Some(None)` is a present-but-null collection.
    pub fn as_collection(&self) -> Option<Option<RawHandle>> {
        match self {
            AttrValue::Collection(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&NotifyCallback> {
        match self {
            AttrValue::Callback(cb) => Some(cb),
            _ => None,
        }
    }
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::U32(v) => write!(f, "U32({})", v),
            AttrValue::U64(v) => write!(f, "U64({})", v),
            AttrValue::Bool(v) => write!(f, "Bool({})", v),
            AttrValue::Text(s) => write!(f, "Text({:?})", s),
            AttrValue::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            AttrValue::Handle(h) => write!(f, "Handle({:?})", h),
            AttrValue::Collection(c) => write!(f, "Collection({:?})", c),
            AttrValue::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// One diagnostic record of a failed native call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: i32,
    pub message: String,
}

/// Primitive operations of the native client library.
///
/// Implementations must be callable from any thread: notifications are
/// decoded on threads the library owns.
pub trait NativeClient: Send + Sync {
    /// Allocate a handle of `kind` under an environment.
    fn handle_alloc(&self, env: RawHandle, kind: HandleKind) -> Result<RawHandle, Status>;

    /// Release a handle previously allocated with `handle_alloc`.
    fn handle_free(&self, handle: RawHandle, kind: HandleKind) -> Status;

    fn attr_set(
        &self,
        target: RawHandle,
        kind: HandleKind,
        attr: Attribute,
        value: AttrValue,
        err: RawHandle,
    ) -> Status;

    fn attr_get(
        &self,
        target: RawHandle,
        kind: HandleKind,
        attr: Attribute,
        err: RawHandle,
    ) -> Result<AttrValue, Status>;

    fn coll_size(&self, env: RawHandle, err: RawHandle, coll: RawHandle) -> Result<u32, Status>;

    /// Element `index` of a collection, `None` if the element does not exist.
    fn coll_get_elem(
        &self,
        env: RawHandle,
        err: RawHandle,
        coll: RawHandle,
        index: u32,
    ) -> Result<Option<RawHandle>, Status>;

    fn stmt_execute(&self, svc: RawHandle, stmt: RawHandle, err: RawHandle, iters: u32) -> Status;

    fn subscription_register(&self, svc: RawHandle, sub: RawHandle, err: RawHandle) -> Status;

    fn subscription_unregister(&self, svc: RawHandle, sub: RawHandle, err: RawHandle) -> Status;

    /// Diagnostic record `record` (1-based) of the last failure on `err`.
    fn error_get(&self, err: RawHandle, record: u32) -> Option<ErrorRecord>;
}
