//! Status codes of native calls and their translation into errors.

use super::{NativeClient, RawHandle};
use crate::error::{NotifyError, Result};

/// Maximum number of diagnostic records read for one failure.
const MAX_ERROR_RECORDS: u32 = 100;

/// Status reported by every native primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    SuccessWithInfo,
    NeedData,
    NoData,
    Error,
    InvalidHandle,
    StillExecuting,
    Continue,
}

impl Status {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Status::Success),
            1 => Some(Status::SuccessWithInfo),
            99 => Some(Status::NeedData),
            100 => Some(Status::NoData),
            -1 => Some(Status::Error),
            -2 => Some(Status::InvalidHandle),
            -3123 => Some(Status::StillExecuting),
            -24200 => Some(Status::Continue),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::SuccessWithInfo => 1,
            Status::NeedData => 99,
            Status::NoData => 100,
            Status::Error => -1,
            Status::InvalidHandle => -2,
            Status::StillExecuting => -3123,
            Status::Continue => -24200,
        }
    }

    /// Plain success, or one of the informational statuses.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::Success | Status::SuccessWithInfo | Status::StillExecuting | Status::Continue
        )
    }
}

/// Turn the status of a native call into a `Result`.
///
/// Informational statuses are logged and treated as success. For `Error`,
/// the diagnostic records on `err` are collected into the returned error.
pub fn check(
    client: &dyn NativeClient,
    err: RawHandle,
    status: Status,
    operation: &'static str,
) -> Result<()> {
    match status {
        Status::Success => Ok(()),
        Status::SuccessWithInfo | Status::StillExecuting | Status::Continue => {
            let info = collect_records(client, err);
            tracing::debug!(
                operation,
                ?status,
                info = %info.1,
                "native call completed with informational status"
            );
            Ok(())
        }
        _ => Err(failure(client, Some(err), status, operation)),
    }
}

/// Build the error for a failed native call.
pub fn failure(
    client: &dyn NativeClient,
    err: Option<RawHandle>,
    status: Status,
    operation: &'static str,
) -> NotifyError {
    let (code, message) = match (status, err) {
        (Status::Error, Some(err)) => collect_records(client, err),
        _ => (None, String::new()),
    };
    let message = if message.is_empty() {
        format!("{:?}", status)
    } else {
        message
    };
    NotifyError::Native {
        operation,
        status,
        code,
        message,
    }
}

/// First non-zero error code and the joined messages of all records.
fn collect_records(client: &dyn NativeClient, err: RawHandle) -> (Option<i32>, String) {
    let mut code = None;
    let mut messages = Vec::new();
    for record in 1..=MAX_ERROR_RECORDS {
        let Some(rec) = client.error_get(err, record) else {
            break;
        };
        if code.is_none() && rec.code != 0 {
            code = Some(rec.code);
        }
        messages.push(rec.message.trim_end().to_string());
    }
    (code, messages.join("; "))
}
