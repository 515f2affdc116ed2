//! Core types for change notifications.

use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Canonical length of a rowid in its character form.
pub const ROWID_LENGTH: usize = 18;

/// Alphabet of the character form of a physical rowid.
const ROWID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Caller-assigned identifier of a subscription.
///
/// Passed to the native layer as the subscription context and used to route
/// every decoded notification back to the handler registered under it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation flags, both for registration masks and for reported changes.
///
/// Bit values follow the client library's opcode constants, so a mask can be
/// handed to the native layer and a reported flag word read back unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationMask(pub u32);

impl OperationMask {
    /// Server rolled the change up to the whole table.
    pub const ALL_ROWS: Self = Self(0x01);
    pub const INSERT: Self = Self(0x02);
    pub const UPDATE: Self = Self(0x04);
    pub const DELETE: Self = Self(0x08);
    pub const ALTER: Self = Self(0x10);
    pub const DROP: Self = Self(0x20);
    pub const UNKNOWN: Self = Self(0x40);

    /// Every operation a subscription can watch.
    pub const ALL: Self = Self(0x02 | 0x04 | 0x08 | 0x10 | 0x20);

    const NAMES: [(OperationMask, &'static str); 7] = [
        (Self::ALL_ROWS, "ALL_ROWS"),
        (Self::INSERT, "INSERT"),
        (Self::UPDATE, "UPDATE"),
        (Self::DELETE, "DELETE"),
        (Self::ALTER, "ALTER"),
        (Self::DROP, "DROP"),
        (Self::UNKNOWN, "UNKNOWN"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The operation bits without the rollup marker.
    pub const fn operations(self) -> Self {
        Self(self.0 & !Self::ALL_ROWS.0)
    }

    /// True if the server reported full-table granularity.
    pub const fn is_rollup(self) -> bool {
        self.intersects(Self::ALL_ROWS)
    }

    /// Mask to attach at registration: an empty mask means every operation.
    pub const fn effective(self) -> Self {
        let ops = Self(self.0 & Self::ALL.0);
        if ops.is_empty() {
            Self::ALL
        } else {
            ops
        }
    }
}

impl BitOr for OperationMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OperationMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OperationMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "OperationMask(NONE)");
        }
        let mut names = Vec::new();
        let mut rest = self.0;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                names.push(name.to_string());
                rest &= !flag.0;
            }
        }
        if rest != 0 {
            names.push(format!("{:#x}", rest));
        }
        write!(f, "OperationMask({})", names.join(" | "))
    }
}

/// Top-level classification of a delivered notification.
///
/// Raw values follow the client library's event-type constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Startup,
    Shutdown,
    ShutdownAny,
    DropDatabase,
    Deregistered,
    ObjectChanged,
}

impl EventKind {
    /// Map a raw notification type. Types this crate does not deliver
    /// (none, query change, anything newer) map to `None`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x1 => Some(EventKind::Startup),
            0x2 => Some(EventKind::Shutdown),
            0x3 => Some(EventKind::ShutdownAny),
            0x4 => Some(EventKind::DropDatabase),
            0x5 => Some(EventKind::Deregistered),
            0x6 => Some(EventKind::ObjectChanged),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            EventKind::Startup => 0x1,
            EventKind::Shutdown => 0x2,
            EventKind::ShutdownAny => 0x3,
            EventKind::DropDatabase => 0x4,
            EventKind::Deregistered => 0x5,
            EventKind::ObjectChanged => 0x6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Startup => "startup",
            EventKind::Shutdown => "shutdown",
            EventKind::ShutdownAny => "shutdown_any",
            EventKind::DropDatabase => "drop_database",
            EventKind::Deregistered => "deregistered",
            EventKind::ObjectChanged => "object_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row identifier in its fixed-length character form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RowId([u8; ROWID_LENGTH]);

/// Physical location encoded in a rowid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowIdComponents {
    pub data_object: u32,
    pub file: u16,
    pub block: u32,
    pub slot: u16,
}

impl RowId {
    /// Validate raw bytes reported by the server.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // Some clients report the length including a trailing NUL.
        let bytes = match bytes.split_last() {
            Some((0, head)) => head,
            _ => bytes,
        };
        if bytes.len() != ROWID_LENGTH {
            return Err(NotifyError::InvalidRowId(format!(
                "expected {} characters, got {}",
                ROWID_LENGTH,
                bytes.len()
            )));
        }
        if let Some(bad) = bytes.iter().find(|b| !ROWID_ALPHABET.contains(b)) {
            return Err(NotifyError::InvalidRowId(format!(
                "invalid character {:?}",
                *bad as char
            )));
        }
        let mut buf = [0u8; ROWID_LENGTH];
        buf.copy_from_slice(bytes);
        Ok(RowId(buf))
    }

    pub fn as_str(&self) -> &str {
        // Validated to be ASCII on construction.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8; ROWID_LENGTH] {
        &self.0
    }

    /// Decode the location fields (6 + 3 + 6 + 3 base-64 digits).
    pub fn components(&self) -> RowIdComponents {
        RowIdComponents {
            data_object: self.digits(0, 6) as u32,
            file: self.digits(6, 3) as u16,
            block: self.digits(9, 6) as u32,
            slot: self.digits(15, 3) as u16,
        }
    }

    fn digits(&self, start: usize, len: usize) -> u64 {
        self.0[start..start + len].iter().fold(0u64, |acc, b| {
            let digit = ROWID_ALPHABET.iter().position(|a| a == b).unwrap_or(0) as u64;
            (acc << 6) | digit
        })
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.as_str())
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowId {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        RowId::from_bytes(s.as_bytes())
    }
}

impl TryFrom<String> for RowId {
    type Error = NotifyError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RowId> for String {
    fn from(rowid: RowId) -> Self {
        rowid.as_str().to_string()
    }
}

/// One changed row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub rowid: RowId,
    /// Operation flags the server reported for this row.
    pub operations: OperationMask,
}

/// Row-level detail of a table change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "granularity", rename_all = "snake_case")]
pub enum RowChanges {
    /// The server rolled the change up to the whole table.
    FullTable,
    /// Rowids were not requested at registration.
    NotRequested,
    /// Rows in server order.
    Rows { rows: Vec<RowChange> },
}

impl RowChanges {
    /// Row count for host callbacks: -1 when there is no row-level data.
    pub fn row_count(&self) -> i64 {
        match self {
            RowChanges::FullTable | RowChanges::NotRequested => -1,
            RowChanges::Rows { rows } => rows.len() as i64,
        }
    }

    pub fn rows(&self) -> &[RowChange] {
        match self {
            RowChanges::Rows { rows } => rows,
            _ => &[],
        }
    }
}

/// Change to one watched object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChange {
    /// Schema-qualified table name, e.g. `HR.EMPLOYEES`.
    pub table_name: String,
    /// Reported operations, without the rollup marker.
    pub operations: OperationMask,
    pub rows: RowChanges,
}

/// A decoded notification, handed to exactly one handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    /// Database name, when the server reports it.
    pub database: Option<String>,
    /// Present only for `ObjectChanged`.
    pub object: Option<ObjectChange>,
}

impl NotificationEvent {
    /// An event without object payload (startup, shutdown, deregistration).
    pub fn database_event(kind: EventKind, database: Option<String>) -> Self {
        Self {
            kind,
            database,
            object: None,
        }
    }

    pub fn object_changed(database: Option<String>, change: ObjectChange) -> Self {
        Self {
            kind: EventKind::ObjectChanged,
            database,
            object: Some(change),
        }
    }

    /// Table name, empty for non-object events.
    pub fn table_name(&self) -> &str {
        self.object.as_ref().map_or("", |o| o.table_name.as_str())
    }

    pub fn operations(&self) -> OperationMask {
        self.object
            .as_ref()
            .map_or(OperationMask::empty(), |o| o.operations)
    }

    /// -1 when the event carries no row-level data.
    pub fn row_count(&self) -> i64 {
        self.object.as_ref().map_or(-1, |o| o.rows.row_count())
    }

    pub fn rowids(&self) -> impl Iterator<Item = &RowId> + '_ {
        self.object
            .iter()
            .flat_map(|o| o.rows.rows().iter().map(|r| &r.rowid))
    }
}
