//! Handles and scoped handle ownership.

use super::{status, HandleKind, NativeClient};
use crate::error::Result;
use std::fmt;

/// Opaque native handle. Zero is the null handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RawHandle(pub u64);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

/// Handle set of a live, authenticated session.
///
/// Supplied by whoever owns the connection; this crate never creates or
/// tears down sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionContext {
    pub env: RawHandle,
    pub error: RawHandle,
    pub service: RawHandle,
    pub session: RawHandle,
}

/// A handle that is released when dropped unless ownership is taken with
/// [`ScopedHandle::into_raw`].
pub struct ScopedHandle<'a> {
    client: &'a dyn NativeClient,
    handle: RawHandle,
    kind: HandleKind,
    armed: bool,
}

impl<'a> ScopedHandle<'a> {
    /// Allocate a handle of `kind` under `env`.
    pub fn alloc(client: &'a dyn NativeClient, env: RawHandle, kind: HandleKind) -> Result<Self> {
        match client.handle_alloc(env, kind) {
            Ok(handle) if !handle.is_null() => Ok(Self {
                client,
                handle,
                kind,
                armed: true,
            }),
            Ok(_) => Err(status::failure(
                client,
                None,
                super::Status::InvalidHandle,
                "handle alloc",
            )),
            Err(status) => Err(status::failure(client, None, status, "handle alloc")),
        }
    }

    /// Take ownership of an already allocated handle.
    pub fn adopt(client: &'a dyn NativeClient, handle: RawHandle, kind: HandleKind) -> Self {
        Self {
            client,
            handle,
            kind,
            armed: !handle.is_null(),
        }
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    /// Keep the handle alive past this scope.
    pub fn into_raw(mut self) -> RawHandle {
        self.armed = false;
        self.handle
    }
}

impl Drop for ScopedHandle<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let status = self.client.handle_free(self.handle, self.kind);
        if !status.is_success() {
            tracing::warn!(
                handle = ?self.handle,
                kind = ?self.kind,
                ?status,
                "failed to free native handle"
            );
        }
    }
}
