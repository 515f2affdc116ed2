//! Decoding of raw change descriptors.
//!
//! A descriptor is walked through the native attribute and collection
//! primitives:
//!
//! ```text
//! change descriptor
//!   NFYTYPE                        startup | shutdown | dereg | objchange ...
//!   DBNAME
//!   TABLE_CHANGES  [table descriptor]
//!     TABLE_NAME, TABLE_OPFLAGS
//!     TABLE_ROW_CHANGES  [row descriptor]
//!       ROW_ROWID, ROW_OPFLAGS
//! ```
//!
//! Tables and rows are emitted in collection order. A table whose rows
//! cannot be read is skipped and counted; the rest of the notification is
//! still delivered.

use crate::error::{NotifyError, Result};
use crate::native::{failure, AttrValue, Attribute, HandleKind, NativeClient, RawHandle};
use crate::types::{
    EventKind, NotificationEvent, ObjectChange, OperationMask, RowChange, RowChanges, RowId,
};
use tracing::{debug, warn};

/// Per-subscription decoding switches.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeOptions {
    /// Rowids were requested at registration.
    pub rowids_requested: bool,
}

/// Everything extracted from one delivered descriptor.
#[derive(Clone, Debug, Default)]
pub struct DecodedNotification {
    /// Raw notification type as reported by the server.
    pub raw_type: u32,
    /// `None` for types this crate does not deliver.
    pub kind: Option<EventKind>,
    pub database: Option<String>,
    /// Events in server order; one per table for object changes.
    pub events: Vec<NotificationEvent>,
    /// Tables dropped because their row detail could not be read.
    pub skipped_tables: usize,
}

/// Reads change descriptors through a native client.
pub struct NotificationDecoder<'a> {
    client: &'a dyn NativeClient,
    env: RawHandle,
    err: RawHandle,
}

impl<'a> NotificationDecoder<'a> {
    /// `env` and `err` are the handles used for collection access and
    /// diagnostics on the delivering thread.
    pub fn new(client: &'a dyn NativeClient, env: RawHandle, err: RawHandle) -> Self {
        Self { client, env, err }
    }

    pub fn decode(&self, descriptor: RawHandle, options: DecodeOptions) -> Result<DecodedNotification> {
        let raw_type = self
            .get(descriptor, HandleKind::ChangeDescriptor, Attribute::ChdesNotifyType)?
            .as_u32()
            .ok_or(NotifyError::UnexpectedAttribute {
                attribute: Attribute::ChdesNotifyType.name(),
                expected: "u32",
            })?;
        let kind = EventKind::from_raw(raw_type);
        let database = self.database_name(descriptor);

        let mut decoded = DecodedNotification {
            raw_type,
            kind,
            database: database.clone(),
            ..Default::default()
        };

        match kind {
            None => {
                debug!(raw_type, "ignoring unsupported notification type");
            }
            Some(EventKind::ObjectChanged) => {
                let tables = self.collection(
                    descriptor,
                    HandleKind::ChangeDescriptor,
                    Attribute::ChdesTableChanges,
                )?;
                decoded.events.reserve(tables.len());
                for (index, table) in tables.into_iter().enumerate() {
                    match self.decode_table(table, options) {
                        Ok(change) => decoded
                            .events
                            .push(NotificationEvent::object_changed(database.clone(), change)),
                        Err(e) => {
                            warn!(table = index, error = %e, "skipping table, partial delivery");
                            decoded.skipped_tables += 1;
                        }
                    }
                }
            }
            Some(kind) => {
                decoded
                    .events
                    .push(NotificationEvent::database_event(kind, database));
            }
        }

        Ok(decoded)
    }

    fn decode_table(&self, table: RawHandle, options: DecodeOptions) -> Result<ObjectChange> {
        let table_name = self
            .get(table, HandleKind::TableChangeDescriptor, Attribute::ChdesTableName)?
            .as_text()
            .map(str::to_string)
            .ok_or(NotifyError::UnexpectedAttribute {
                attribute: Attribute::ChdesTableName.name(),
                expected: "text",
            })?;
        let flags = self.flags(table, HandleKind::TableChangeDescriptor, Attribute::ChdesTableOpFlags)?;

        let rows = if flags.is_rollup() {
            debug!(table = %table_name, "full table invalidation");
            RowChanges::FullTable
        } else if !options.rowids_requested {
            RowChanges::NotRequested
        } else {
            let rows = self.decode_rows(table).map_err(|e| {
                NotifyError::Decode(format!("rows of {}: {}", table_name, e))
            })?;
            RowChanges::Rows { rows }
        };

        Ok(ObjectChange {
            table_name,
            operations: flags.operations(),
            rows,
        })
    }

    fn decode_rows(&self, table: RawHandle) -> Result<Vec<RowChange>> {
        let handles = self.collection(
            table,
            HandleKind::TableChangeDescriptor,
            Attribute::ChdesTableRowChanges,
        )?;
        let mut rows = Vec::new();
        rows.try_reserve_exact(handles.len())
            .map_err(|_| NotifyError::RowBuffer { rows: handles.len() })?;
        for row in handles {
            let value = self.get(row, HandleKind::RowChangeDescriptor, Attribute::ChdesRowRowid)?;
            let bytes = value.as_bytes().ok_or(NotifyError::UnexpectedAttribute {
                attribute: Attribute::ChdesRowRowid.name(),
                expected: "bytes",
            })?;
            rows.push(RowChange {
                rowid: RowId::from_bytes(bytes)?,
                operations: self.flags(row, HandleKind::RowChangeDescriptor, Attribute::ChdesRowOpFlags)?,
            });
        }
        Ok(rows)
    }

    /// Elements of a collection attribute. A null collection is empty.
    fn collection(&self, target: RawHandle, kind: HandleKind, attr: Attribute) -> Result<Vec<RawHandle>> {
        let value = self.get(target, kind, attr)?;
        let coll = match value {
            AttrValue::Collection(Some(coll)) => coll,
            AttrValue::Collection(None) => return Ok(Vec::new()),
            _ => {
                return Err(NotifyError::UnexpectedAttribute {
                    attribute: attr.name(),
                    expected: "collection",
                })
            }
        };

        let size = self
            .client
            .coll_size(self.env, self.err, coll)
            .map_err(|s| failure(self.client, Some(self.err), s, "collection size"))?;
        let mut elements = Vec::new();
        elements
            .try_reserve_exact(size as usize)
            .map_err(|_| NotifyError::RowBuffer { rows: size as usize })?;
        for index in 0..size {
            let element = self
                .client
                .coll_get_elem(self.env, self.err, coll, index)
                .map_err(|s| failure(self.client, Some(self.err), s, "collection element"))?
                .ok_or_else(|| {
                    NotifyError::Decode(format!("{} element {} of {} missing", attr, index, size))
                })?;
            elements.push(element);
        }
        Ok(elements)
    }

    fn flags(&self, target: RawHandle, kind: HandleKind, attr: Attribute) -> Result<OperationMask> {
        self.get(target, kind, attr)?
            .as_u32()
            .map(OperationMask)
            .ok_or(NotifyError::UnexpectedAttribute {
                attribute: attr.name(),
                expected: "u32",
            })
    }

    fn database_name(&self, descriptor: RawHandle) -> Option<String> {
        match self.client.attr_get(descriptor, HandleKind::ChangeDescriptor, Attribute::ChdesDbName, self.err) {
            Ok(value) => value.as_text().map(str::to_string),
            Err(_) => None,
        }
    }

    fn get(&self, target: RawHandle, kind: HandleKind, attr: Attribute) -> Result<AttrValue> {
        self.client
            .attr_get(target, kind, attr, self.err)
            .map_err(|s| failure(self.client, Some(self.err), s, attr.name()))
    }
}
