//! Control channel client
//!
//! Every launch talks to the resident instance through here first. Not
//! finding one is a normal outcome and gets its own error variant.

use super::protocol::{to_line, Request, Response};
use crate::job::Job;
use crate::status::Status;
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[cfg(unix)]
use tokio::net::UnixStream;
#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

/// Error type for control channel requests
#[derive(Debug, Error)]
pub enum ClientError {
    /// Nothing listens on the address
    #[error("No current main instance running")]
    NoServer,

    #[error("Control channel IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed control channel message: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The server closed the connection without answering
    #[error("The main instance did not answer the {0} request")]
    NoResponse(&'static str),

    #[error("The main instance answered a {request} request with a {response} response")]
    Mismatch {
        request: &'static str,
        response: &'static str,
    },

    #[error("The main instance rejected the {0} request")]
    Rejected(&'static str),
}

/// Send one request and wait for its response
pub async fn send(path: &Path, request: &Request) -> Result<Response, ClientError> {
    #[cfg(unix)]
    let stream = UnixStream::connect(path).await.map_err(connect_error)?;
    #[cfg(windows)]
    let stream = ClientOptions::new().open(path).map_err(connect_error)?;

    exchange(stream, request).await
}

fn connect_error(e: io::Error) -> ClientError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => ClientError::NoServer,
        _ => ClientError::Io(e),
    }
}

async fn exchange<S>(mut stream: S, request: &Request) -> Result<Response, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&to_line(request)?).await?;
    stream.flush().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;

    let line = String::from_utf8_lossy(&buf);
    let line = line.trim();
    if line.is_empty() {
        return Err(ClientError::NoResponse(request.kind()));
    }

    let response: Response = serde_json::from_str(line)?;
    if response.kind() != request.kind() {
        return Err(ClientError::Mismatch {
            request: request.kind(),
            response: response.kind(),
        });
    }
    Ok(response)
}

fn require_success(response: Response) -> Result<Response, ClientError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ClientError::Rejected(response.kind()))
    }
}

/// Hand a job to the running instance
pub async fn enqueue(path: &Path, job: Job) -> Result<(), ClientError> {
    require_success(send(path, &Request::Enqueue { job }).await?).map(|_| ())
}

/// Ask the running instance to stop; returns once it has
pub async fn kill(path: &Path) -> Result<(), ClientError> {
    require_success(send(path, &Request::Kill).await?).map(|_| ())
}

/// Current status of the running instance
pub async fn status(path: &Path) -> Result<Status, ClientError> {
    match require_success(send(path, &Request::Status).await?)? {
        Response::Status { status_snapshot, .. } => Ok(status_snapshot),
        other => Err(ClientError::Mismatch {
            request: "status",
            response: other.kind(),
        }),
    }
}
