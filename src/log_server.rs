//! Diagnostic log server
//!
//! Streams every formatted log line to connected TCP clients. One task owns
//! the listener, one task per client forwards lines from the logging tap.
//! A client that falls behind loses lines and is told how many.
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::logging::LogHandle;

pub struct LogServer {
    local_addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl LogServer {
    /// Bind `addr` and start accepting clients
    pub async fn start(addr: SocketAddr, logs: LogHandle, parent: &CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let token = parent.child_token();
        let handle = tokio::spawn(accept_loop(listener, logs, token.clone()));

        info!(address = %local_addr, "log server listening");
        Ok(Self {
            local_addr,
            token,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "log server task failed");
        }
    }
}

async fn accept_loop(listener: TcpListener, logs: LogHandle, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "log client connected");
                    tokio::spawn(serve_client(stream, peer, logs.subscribe(), token.clone()));
                }
                Err(e) => warn!(error = %e, "log server accept failed"),
            },
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut lines: broadcast::Receiver<String>,
    token: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.recv() => line,
        };

        let written = match line {
            Ok(line) => stream.write_all(line.as_bytes()).await,
            Err(RecvError::Lagged(skipped)) => {
                stream
                    .write_all(format!("... {skipped} lines skipped\n").as_bytes())
                    .await
            }
            Err(RecvError::Closed) => break,
        };

        if written.is_err() {
            break;
        }
    }
    debug!(%peer, "log client disconnected");
}
