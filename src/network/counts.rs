//! Counts channel: photon-count samples streamed by the device.
//!
//! The device writes one ASCII record per measurement period,
//! `timestamp,count_1,count_2,...\n`. A background task parses incoming
//! records into [`Sample`]s and appends them to a bounded [`SampleRing`].
//! The ring also keeps an arrival counter of every sample ever received,
//! which [`CountsChannel::wait_for_n`] uses to wait for *new* samples even
//! after old ones have been evicted.
//!
//! # Known lossy behaviour
//!
//! Only the first newline-delimited record of each socket read is parsed.
//! When the device outpaces the reader and one read returns several
//! records, the rest are discarded. Bytes of a record split across two
//! reads are not stitched back together either.
//!
//! `wait_for_n` has no timeout: it waits for as long as the device keeps
//! the stream silent.

use crate::error::{AppResult, WebSqError};
use crate::network::link::{connect_stream, is_transient, ChannelHealth, Link};
use serde::Serialize;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// One counts record: a timestamp followed by one count per detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Device timestamp (first field of the record)
    pub timestamp: f64,
    /// Counts per detector channel, in channel order
    pub counts: Vec<f64>,
}

impl Sample {
    /// Number of detector channels in this sample.
    pub fn channels(&self) -> usize {
        self.counts.len()
    }
}

/// A counts record that could not be parsed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseSampleError {
    /// The record held no fields at all.
    #[error("empty counts record")]
    Empty,
    /// A field was not a decimal number.
    #[error("field {index} is not a number: '{field}'")]
    InvalidField {
        /// Zero-based field position
        index: usize,
        /// Offending text
        field: String,
    },
    /// The record was not valid UTF-8.
    #[error("counts record is not valid UTF-8")]
    InvalidUtf8,
}

impl FromStr for Sample {
    type Err = ParseSampleError;

    fn from_str(record: &str) -> Result<Self, Self::Err> {
        let record = record.trim();
        if record.is_empty() {
            return Err(ParseSampleError::Empty);
        }

        let mut fields = record
            .split(',')
            .enumerate()
            .map(|(index, field)| {
                field
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| ParseSampleError::InvalidField {
                        index,
                        field: field.to_string(),
                    })
            });

        let timestamp = fields.next().ok_or(ParseSampleError::Empty)??;
        let counts = fields.collect::<Result<Vec<_>, _>>()?;
        Ok(Self { timestamp, counts })
    }
}

/// Parse the first newline-delimited record of a socket read.
pub fn parse_first_record(chunk: &[u8]) -> Result<Sample, ParseSampleError> {
    let end = chunk
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(chunk.len());
    std::str::from_utf8(&chunk[..end])
        .map_err(|_| ParseSampleError::InvalidUtf8)?
        .parse()
}

/// Bounded FIFO of samples plus a counter of every sample ever pushed.
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: VecDeque<Sample>,
    capacity: usize,
    total: u64,
}

impl SampleRing {
    /// Create an empty ring holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    /// Append a sample, evicting the oldest ones beyond capacity.
    pub fn push(&mut self, sample: Sample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        self.total += 1;
    }

    /// Up to `n` most recent samples, oldest first.
    pub fn latest(&self, n: usize) -> Vec<Sample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).cloned().collect()
    }

    /// Samples currently retained.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample is retained.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of retained samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples received since the ring was created, evicted ones included.
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Tuning for a [`CountsChannel`].
#[derive(Debug, Clone)]
pub struct CountsOptions {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Ring buffer capacity in samples
    pub buffer: usize,
    /// Size of each socket read
    pub read_buffer_bytes: usize,
}

impl Default for CountsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            buffer: 100,
            read_buffer_bytes: 64 * 1024,
        }
    }
}

struct CountsState {
    ring: Mutex<SampleRing>,
    arrivals: watch::Sender<u64>,
}

/// Client side of the WebSQ counts stream.
pub struct CountsChannel {
    peer: String,
    link: Mutex<Option<Link>>,
    state: Arc<CountsState>,
    health: watch::Receiver<ChannelHealth>,
    task: JoinHandle<()>,
}

impl CountsChannel {
    /// Connect to the counts port and start the receive task.
    pub async fn connect(addr: &str, options: CountsOptions) -> AppResult<Self> {
        let stream = connect_stream(addr, options.connect_timeout).await?;
        tracing::info!(%addr, buffer = options.buffer, "counts channel connected");
        Self::from_stream(stream, options)
    }

    /// Start the receive task on an already-connected stream.
    pub fn from_stream(stream: TcpStream, options: CountsOptions) -> AppResult<Self> {
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (health_tx, health_rx) = watch::channel(ChannelHealth::Running);
        let (arrivals, _) = watch::channel(0);

        let state = Arc::new(CountsState {
            ring: Mutex::new(SampleRing::new(options.buffer)),
            arrivals,
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
            task,
        })
    }

    /// Wait until `n` more samples have arrived, then return the `n` most
    /// recent retained samples, oldest first.
    ///
    /// If the ring evicted part of that range, or `n` exceeds its capacity,
    /// fewer than `n` samples come back. There is no timeout.
    pub async fn wait_for_n(&self, n: usize) -> AppResult<Vec<Sample>> {
        let mut arrivals = self.state.arrivals.subscribe();
        let target = self.state.ring.lock().await.total() + n as u64;

        arrivals
            .wait_for(|total| *total >= target)
            .await
            .map_err(|_| WebSqError::ChannelClosed("counts"))?;

        Ok(self.state.ring.lock().await.latest(n))
    }

    /// Up to `n` most recent samples without waiting.
    pub async fn latest(&self, n: usize) -> Vec<Sample> {
        self.state.ring.lock().await.latest(n)
    }

    /// Number of samples received so far, evicted ones included.
    pub async fn total_received(&self) -> u64 {
        self.state.ring.lock().await.total()
    }

    /// Number of samples currently retained.
    pub async fn retained(&self) -> usize {
        self.state.ring.lock().await.len()
    }

    /// Stop the receive task and close the socket. Safe to call twice.
    ///
    /// Callers already blocked in [`wait_for_n`](Self::wait_for_n) stay blocked.
    pub async fn close(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            tracing::info!(peer = %self.peer, "closing counts channel");
            link.close().await;
        }
    }

    /// Liveness of the receive task.
    pub fn health(&self) -> ChannelHealth {
        self.health.borrow().clone()
    }

    /// Address of the device end of the socket.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for CountsChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive_task(
    reader: OwnedReadHalf,
    state: Arc<CountsState>,
    shutdown: oneshot::Receiver<()>,
    health: watch::Sender<ChannelHealth>,
    read_buffer_bytes: usize,
) {
    let outcome = receive_loop(reader, &state, shutdown, read_buffer_bytes).await;
    let status = match outcome {
        Ok(()) => {
            tracing::debug!("counts receive loop stopped");
            ChannelHealth::Closed
        }
        Err(e) => {
            tracing::error!(error = %e, "counts receive loop terminated");
            ChannelHealth::Failed(e.to_string())
        }
    };
    health.send_replace(status);
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    state: &CountsState,
    mut shutdown: oneshot::Receiver<()>,
    read_buffer_bytes: usize,
) -> AppResult<()> {
    let mut buf = vec![0u8; read_buffer_bytes];

    loop {
        let n = tokio::select! {
            biased;
            _ = &mut shutdown => return Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    return Err(WebSqError::ConnectionLost(
                        "counts channel closed by device".to_string(),
                    ))
                }
                Ok(n) => n,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            },
        };

        let chunk = &buf[..n];
        let sample = match parse_first_record(chunk) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unparseable counts record");
                continue;
            }
        };

        let extra = chunk
            .split(|&b| b == b'\n')
            .skip(1)
            .filter(|record| !record.is_empty())
            .count();
        if extra > 0 {
            tracing::trace!(extra, "discarding additional counts records in one read");
        }

        let total = {
            let mut ring = state.ring.lock().await;
            ring.push(sample);
            ring.total()
        };
        state.arrivals.send_replace(total);
    }
}
