//! Coordination server: Unix socket listener and accept loop.

mod connection;

#[cfg(test)]
mod tests;

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::coord::Coordinator;

pub use connection::serve_connection;

/// Only the owning user may connect.
const SOCKET_MODE: u32 = 0o600;

/// Server startup or runtime failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("another server is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),
}

/// A bound coordination server.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    coordinator: Arc<Coordinator>,
}

impl Server {
    /// Bind the socket at `path`.
    ///
    /// A leftover socket file nobody is accepting on is removed first; a
    /// live one means another server owns the endpoint. The socket is
    /// created readable and writable by the current user only.
    pub fn bind(path: &Path) -> Result<Self, ServerError> {
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(ServerError::AlreadyRunning(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))?;

        tracing::info!(path = %path.display(), "listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            coordinator: Arc::new(Coordinator::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` is cancelled, then close every
    /// connection and remove the socket file.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let coordinator = self.coordinator.clone();
                        tokio::spawn(serve_connection(stream, coordinator, shutdown.child_token()));
                    }
                    Err(e) => {
                        // Transient accept failures shouldn't stop the server.
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, no longer accepting");
                    break;
                }
            }
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove socket file");
        }
    }
}
