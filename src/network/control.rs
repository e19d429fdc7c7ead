//! Control channel: live mirror of the device's labels.
//!
//! A background task reads the control socket, decodes `0x17`-terminated
//! JSON frames and merges every labelled push into a [`LabelTable`].
//! Callers read that table through [`ControlChannel::get`], which waits
//! (bounded by the label timeout) until the label has been seen, and push
//! commands with [`ControlChannel::send`].
//!
//! # Locking
//!
//! - The label table sits behind one mutex, taken for every read and for the
//!   whole of each merge.
//! - The socket's write half and the reader's shutdown signal share a second
//!   mutex, so `send` never races `close`.
//! - The device-error callback runs after the table lock is released and
//!   receives an owned copy of the value. It may call back into the channel.

use crate::error::{AppResult, WebSqError};
use crate::network::framing::FrameDecoder;
use crate::network::link::{connect_stream, is_transient, ChannelHealth, Link};
use crate::network::protocol::{LabelTable, LabelUpdate, MergeOutcome, RequestEnvelope};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Error reported by the device through a label containing `Error`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceError {
    /// Label the error arrived on
    pub label: String,
    /// Value pushed with it
    pub value: Value,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.value)
    }
}

/// Callback invoked for every device-reported error.
pub type ErrorCallback = Arc<dyn Fn(DeviceError) + Send + Sync>;

/// Tuning for a [`ControlChannel`].
#[derive(Clone)]
pub struct ControlOptions {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Ceiling for [`ControlChannel::get`]
    pub label_timeout: Duration,
    /// Size of each socket read
    pub read_buffer_bytes: usize,
    /// Receives device-reported errors; when unset they are logged
    pub on_error: Option<ErrorCallback>,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            label_timeout: Duration::from_secs(10),
            read_buffer_bytes: 64 * 1024,
            on_error: None,
        }
    }
}

impl fmt::Debug for ControlOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlOptions")
            .field("connect_timeout", &self.connect_timeout)
            .field("label_timeout", &self.label_timeout)
            .field("read_buffer_bytes", &self.read_buffer_bytes)
            .field("has_error_callback", &self.on_error.is_some())
            .finish()
    }
}

impl ControlOptions {
    /// Install a device-error callback.
    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Override the label wait ceiling.
    pub fn with_label_timeout(mut self, label_timeout: Duration) -> Self {
        self.label_timeout = label_timeout;
        self
    }
}

/// State shared between the channel handle and its receive task.
struct LabelState {
    table: Mutex<LabelTable>,
    changed: Notify,
    on_error: Option<ErrorCallback>,
}

impl LabelState {
    async fn apply(&self, message: &Value) {
        let Some(update) = LabelUpdate::from_message(message) else {
            return;
        };

        let outcome = self.table.lock().await.apply(&update);
        match outcome {
            MergeOutcome::Discarded => tracing::debug!(
                label = %update.label,
                "discarding value for label without descriptor"
            ),
            MergeOutcome::Replaced | MergeOutcome::Updated => self.changed.notify_waiters(),
        }

        if update.is_error() {
            let error = DeviceError {
                label: update.label,
                value: update.value,
            };
            match &self.on_error {
                Some(callback) => callback(error),
                None => tracing::error!(%error, "device reported an error"),
            }
        }
    }
}

/// Client side of the WebSQ JSON control channel.
pub struct ControlChannel {
    peer: String,
    link: Mutex<Option<Link>>,
    state: Arc<LabelState>,
    health: watch::Receiver<ChannelHealth>,
    label_timeout: Duration,
    task: JoinHandle<()>,
}

impl ControlChannel {
    /// Connect to the control port and start the receive task.
    ///
    /// Immediately asks the device for every label descriptor.
    pub async fn connect(addr: &str, options: ControlOptions) -> AppResult<Self> {
        let stream = connect_stream(addr, options.connect_timeout).await?;
        tracing::info!(%addr, "control channel connected");
        let channel = Self::from_stream(stream, options)?;
        channel.send(&RequestEnvelope::label_props().to_json()?).await?;
        Ok(channel)
    }

    /// Start the receive task on an already-connected stream.
    pub fn from_stream(stream: TcpStream, options: ControlOptions) -> AppResult<Self> {
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (health_tx, health_rx) = watch::channel(ChannelHealth::Running);

        let state = Arc::new(LabelState {
            table: Mutex::new(LabelTable::new()),
            changed: Notify::new(),
            on_error: options.on_error,
        });

        let task = tokio::spawn(receive_task(
            reader,
            state.clone(),
            shutdown_rx,
            health_tx,
            options.read_buffer_bytes.max(1),
        ));

        Ok(Self {
            peer,
            link: Mutex::new(Some(Link::new(writer, shutdown_tx))),
            state,
            health: health_rx,
            label_timeout: options.label_timeout,
            task,
        })
    }

    /// Write a raw message to the device. No acknowledgment is awaited.
    pub async fn send(&self, message: &str) -> AppResult<()> {
        let mut link = self.link.lock().await;
        let link = link.as_mut().ok_or(WebSqError::ChannelClosed("control"))?;
        tracing::debug!(peer = %self.peer, %message, "control send");
        link.writer.write_all(message.as_bytes()).await?;
        link.writer.flush().await?;
        Ok(())
    }

    /// Descriptor stored for `label`, waiting until it has been pushed.
    ///
    /// Returns at once if the label is already known. Fails with
    /// [`WebSqError::Timeout`] when the label does not appear within the
    /// label timeout.
    pub async fn get(&self, label: &str) -> AppResult<Value> {
        let deadline = Instant::now() + self.label_timeout;
        loop {
            let notified = self.state.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(descriptor) = self.state.table.lock().await.get(label) {
                return Ok(descriptor.clone());
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(WebSqError::Timeout {
                    label: label.to_string(),
                    waited: self.label_timeout,
                });
            }
        }
    }

    /// Current `value` field of the descriptor stored for `label`.
    pub async fn get_value(&self, label: &str) -> AppResult<Value> {
        let descriptor = self.get(label).await?;
        descriptor
            .get("value")
            .cloned()
            .ok_or_else(|| WebSqError::UnexpectedValue {
                label: label.to_string(),
                reason: "descriptor has no value field".to_string(),
            })
    }

    /// Wait until the `value` field stored for `label` satisfies `accept`.
    ///
    /// Bounded by the label timeout like [`get`](Self::get).
    pub async fn wait_for_value<F>(&self, label: &str, mut accept: F) -> AppResult<Value>
    where
        F: FnMut(&Value) -> bool,
    {
        let deadline = Instant::now() + self.label_timeout;
        loop {
            let notified = self.state.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self
                .state
                .table
                .lock()
                .await
                .get(label)
                .and_then(|descriptor| descriptor.get("value"))
                .cloned();
            if let Some(value) = current.filter(|value| accept(value)) {
                return Ok(value);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(WebSqError::Timeout {
                    label: label.to_string(),
                    waited: self.label_timeout,
                });
            }
        }
    }

    /// Snapshot of every known label.
    pub async fn get_all(&self) -> HashMap<String, Value> {
        self.state.table.lock().await.snapshot()
    }

    /// Stop the receive task and close the socket. Safe to call twice.
    pub async fn close(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            tracing::info!(peer = %self.peer, "closing control channel");
            link.close().await;
        }
    }

    /// Liveness of the receive task.
    pub fn health(&self) -> ChannelHealth {
        self.health.borrow().clone()
    }

    /// Ceiling applied to label waits.
    pub fn label_timeout(&self) -> Duration {
        self.label_timeout
    }

    /// Address of the device end of the socket.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive_task(
    reader: OwnedReadHalf,
    state: Arc<LabelState>,
    shutdown: oneshot::Receiver<()>,
    health: watch::Sender<ChannelHealth>,
    read_buffer_bytes: usize,
) {
    let outcome = receive_loop(reader, &state, shutdown, read_buffer_bytes).await;
    let status = match outcome {
        Ok(()) => {
            tracing::debug!("control receive loop stopped");
            ChannelHealth::Closed
        }
        Err(e) => {
            tracing::error!(error = %e, "control receive loop terminated");
            ChannelHealth::Failed(e.to_string())
        }
    };
    health.send_replace(status);
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    state: &LabelState,
    mut shutdown: oneshot::Receiver<()>,
    read_buffer_bytes: usize,
) -> AppResult<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; read_buffer_bytes];

    loop {
        let n = tokio::select! {
            biased;
            _ = &mut shutdown => return Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    return Err(WebSqError::ConnectionLost(
                        "control channel closed by device".to_string(),
                    ))
                }
                Ok(n) => n,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            },
        };

        decoder.extend(&buf[..n]);
        for message in decoder.next_messages() {
            state.apply(&message).await;
        }
    }
}
