//! Socket ownership shared by the control and counts channels.
//!
//! Each channel splits its `TcpStream`: the read half moves into the
//! background receive task, while the write half and the task's shutdown
//! signal stay together in a [`Link`] behind the channel's close lock.
//! Dropping or closing the link is what stops the receive task.

use crate::error::{AppResult, WebSqError};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Liveness of a channel's receive task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelHealth {
    /// The receive task is reading from the socket.
    Running,
    /// The channel was closed locally and the task exited cleanly.
    Closed,
    /// The task died on a socket failure. No reconnect is attempted.
    Failed(String),
}

impl ChannelHealth {
    /// Whether the receive task is still alive.
    pub fn is_running(&self) -> bool {
        matches!(self, ChannelHealth::Running)
    }
}

/// Write half of a channel's socket plus the shutdown signal of its reader.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) writer: OwnedWriteHalf,
    shutdown: oneshot::Sender<()>,
}

impl Link {
    pub(crate) fn new(writer: OwnedWriteHalf, shutdown: oneshot::Sender<()>) -> Self {
        Self { writer, shutdown }
    }

    /// Signal the receive task, then shut the socket down.
    pub(crate) async fn close(mut self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(error = %e, "socket shutdown after close");
        }
    }
}

/// Open a TCP connection with a connect timeout.
pub(crate) async fn connect_stream(addr: &str, connect_timeout: Duration) -> AppResult<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            WebSqError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection to {addr} timed out after {connect_timeout:?}"),
            ))
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Read errors that are retried on the next loop iteration.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}
