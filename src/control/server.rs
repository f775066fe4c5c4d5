//! Control socket server for the supervisor.
//!
//! Operators connect, send one [`AdminRequest`] line and read one
//! [`AdminResponse`] line back.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::{AdminRequest, AdminResponse, ControlError};

/// Where the supervisor accepts operator requests.
#[derive(Debug)]
pub struct ControlServer {
    socket_path: PathBuf,
}

impl ControlServer {
    #[must_use]
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Bind the socket and answer requests with `handler` until the returned
    /// handle is shut down or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a leftover socket file cannot be removed or
    /// binding fails.
    pub fn start<F, Fut>(&self, handler: F) -> Result<ServerHandle, ControlError>
    where
        F: Fn(AdminRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AdminResponse> + Send + 'static,
    {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(path = %self.socket_path.display(), "Accepting operator requests");

        let stop = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(handler), stop.clone()));

        Ok(ServerHandle {
            socket_path: self.socket_path.clone(),
            stop,
        })
    }
}

/// Running control server. Dropping it stops the server and removes the
/// socket file.
#[derive(Debug)]
pub struct ServerHandle {
    socket_path: PathBuf,
    stop: CancellationToken,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.socket_path.display(),
                error = %e,
                "Could not remove control socket"
            ),
        }
    }
}

async fn serve<F, Fut>(listener: UnixListener, handler: Arc<F>, stop: CancellationToken)
where
    F: Fn(AdminRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AdminResponse> + Send + 'static,
{
    loop {
        let stream = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Operator connection not accepted");
                    continue;
                }
            },
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = answer(stream, handler.as_ref()).await {
                tracing::warn!(error = %e, "Operator request failed");
            }
        });
    }
    tracing::debug!("Control server stopped");
}

/// Read one request line and write one response line.
async fn answer<F, Fut>(stream: UnixStream, handler: &F) -> Result<(), ControlError>
where
    F: Fn(AdminRequest) -> Fut,
    Fut: Future<Output = AdminResponse>,
{
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    if BufReader::new(reader).read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<AdminRequest>(line.trim()) {
        Ok(request) => {
            tracing::debug!(?request, "Operator request");
            handler(request).await
        }
        Err(e) => AdminResponse::Error {
            message: format!("malformed request: {e}"),
        },
    };

    let mut reply = serde_json::to_vec(&response)?;
    reply.push(b'\n');
    writer.write_all(&reply).await?;
    writer.flush().await?;
    Ok(())
}
