//! Control channel messages
//!
//! One JSON object per line, one request and one response per
//! connection.

use crate::job::Job;
use crate::status::Status;
use serde::{Deserialize, Serialize};

/// Largest request accepted by the server
pub const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    /// Queue a job on the running instance
    Enqueue { job: Job },
    /// Abort processing, answered once the running encode has stopped
    Kill,
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Enqueue {
        success: bool,
    },
    Kill {
        success: bool,
    },
    Status {
        success: bool,
        #[serde(rename = "statusSnapshot")]
        status_snapshot: Status,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Enqueue { .. } => "enqueue",
            Request::Kill => "kill",
            Request::Status => "status",
        }
    }
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Enqueue { .. } => "enqueue",
            Response::Kill { .. } => "kill",
            Response::Status { .. } => "status",
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Response::Enqueue { success } | Response::Kill { success } => *success,
            Response::Status { success, .. } => *success,
        }
    }
}

/// Encode a message as one newline terminated line
pub fn to_line<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}
