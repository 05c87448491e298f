//! Control channel server
//!
//! Bound by the resident instance. Every connection carries a single
//! request; the server stays responsive while the queue is encoding.

use super::protocol::{to_line, Request, Response, MAX_REQUEST_BYTES};
use crate::queue::JobQueue;
use log::{debug, error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(windows)]
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

/// Error type for control channel server operations
#[derive(Debug, Error)]
pub enum ServerError {
    /// Another instance already answers on the address
    #[error("Another instance is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept a connection: {0}")]
    Accept(#[source] io::Error),
}

/// Bound control channel, not yet serving
pub struct Server {
    path: PathBuf,
    #[cfg(unix)]
    listener: UnixListener,
    #[cfg(windows)]
    pipe: NamedPipeServer,
}

impl Server {
    /// Claim the well-known address
    ///
    /// A leftover socket file from a crashed instance is replaced; a live
    /// one yields `AlreadyRunning`.
    #[cfg(unix)]
    pub async fn bind(path: &Path) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }

        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if UnixStream::connect(path).await.is_ok() {
                    return Err(ServerError::AlreadyRunning(path.to_path_buf()));
                }
                warn!("Removing stale socket {}", path.display());
                std::fs::remove_file(path).map_err(bind_err)?;
                UnixListener::bind(path).map_err(bind_err)?
            }
            Err(e) => return Err(bind_err(e)),
        };

        info!("Control channel listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    /// Claim the well-known pipe name
    #[cfg(windows)]
    pub async fn bind(path: &Path) -> Result<Self, ServerError> {
        let pipe = ServerOptions::new()
            .first_pipe_instance(true)
            .create(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => ServerError::AlreadyRunning(path.to_path_buf()),
                _ => ServerError::Bind {
                    path: path.to_path_buf(),
                    source: e,
                },
            })?;

        info!("Control channel listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            pipe,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Answer requests until `shutdown` fires, then release the address
    #[cfg(unix)]
    pub async fn serve(self, queue: Arc<JobQueue>, shutdown: CancellationToken) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let queue = queue.clone();
                        tokio::spawn(async move { handle_connection(stream, queue).await });
                    }
                    Err(e) => warn!("{}", ServerError::Accept(e)),
                },
                _ = shutdown.cancelled() => break,
            }
        }

        drop(self.listener);
        remove_socket(&self.path);
        Ok(())
    }

    #[cfg(windows)]
    pub async fn serve(mut self, queue: Arc<JobQueue>, shutdown: CancellationToken) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                connected = self.pipe.connect() => {
                    connected.map_err(ServerError::Accept)?;
                    let next = ServerOptions::new().create(&self.path).map_err(|source| ServerError::Bind {
                        path: self.path.clone(),
                        source,
                    })?;
                    let stream = std::mem::replace(&mut self.pipe, next);
                    let queue = queue.clone();
                    tokio::spawn(async move { handle_connection(stream, queue).await });
                }
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }
}

#[cfg(unix)]
fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove socket {}: {}", path.display(), e),
    }
}

/// Read one request, dispatch it and write the response
async fn handle_connection<S>(stream: S, queue: Arc<JobQueue>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream).take(MAX_REQUEST_BYTES);
    let mut line = String::new();

    match reader.read_line(&mut line).await {
        Ok(0) => {
            debug!("Connection closed before a request was sent");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Failed to read request: {}", e);
            return;
        }
    }

    let request = match serde_json::from_str::<Request>(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            warn!("Ignoring malformed request: {}", e);
            return;
        }
    };

    debug!("Received {} request", request.kind());
    let response = dispatch(request, &queue).await;

    let bytes = match to_line(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to serialize {} response: {}", response.kind(), e);
            return;
        }
    };

    let stream = reader.get_mut().get_mut();
    if let Err(e) = stream.write_all(&bytes).await {
        debug!("Failed to send {} response: {}", response.kind(), e);
        return;
    }
    if let Err(e) = stream.shutdown().await {
        debug!("Failed to close connection: {}", e);
    }
}

pub(crate) async fn dispatch(request: Request, queue: &JobQueue) -> Response {
    match request {
        Request::Enqueue { job } => {
            let success = match job.validate() {
                Ok(()) => {
                    let accepted = queue.push(job);
                    if !accepted {
                        warn!("Refused enqueued job, shutting down");
                    }
                    accepted
                }
                Err(e) => {
                    warn!("Rejected enqueued job: {}", e);
                    false
                }
            };
            Response::Enqueue { success }
        }
        Request::Kill => {
            info!("Kill requested over the control channel");
            queue.abort_processing().await;
            Response::Kill { success: true }
        }
        Request::Status => Response::Status {
            success: true,
            status_snapshot: queue.status().snapshot(),
        },
    }
}
