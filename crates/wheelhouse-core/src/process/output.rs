//! Captured child output.
//!
//! One reader task per pipe copies raw chunks, tagged with the pipe they
//! came from, into a bounded channel. The controlling task drains that
//! channel into an [`OutputSink`] between polls and scans the accumulated
//! text. Only the controlling task touches the buffers, so no lock is
//! needed.
//!
//! Each pipe gets its own buffer. A marker split across two reads of one
//! pipe stays contiguous even when the other pipe writes in between.

use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the chunk channel between the pipe readers and the sink.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Bytes requested per pipe read.
const READ_CHUNK_SIZE: usize = 1024;

/// Which pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One read from one pipe.
pub type OutputChunk = (StreamKind, Vec<u8>);

/// Create the channel a set of pipe readers feed into.
pub fn output_channel() -> (Sender<OutputChunk>, Receiver<OutputChunk>) {
    mpsc::channel(OUTPUT_CHANNEL_CAPACITY)
}

/// Spawn a task that copies `pipe` into `tx` until end-of-file.
///
/// If the receiving side goes away the task keeps reading and discards the
/// data, so the child never blocks on a full pipe.
pub fn spawn_pipe_reader<R>(
    pipe: R,
    stream: StreamKind,
    port: u16,
    tx: Sender<OutputChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut pipe = pipe;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut forwarding = true;

        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    debug!(
                        port,
                        stream = stream.as_str(),
                        "{}",
                        String::from_utf8_lossy(&chunk).trim_end()
                    );
                    if forwarding && tx.send((stream, chunk)).await.is_err() {
                        forwarding = false;
                    }
                }
                Err(e) => {
                    warn!(port, stream = stream.as_str(), error = %e, "error reading server output");
                    break;
                }
            }
        }
    })
}

/// Append-only accumulation of everything a child process has written.
///
/// Every buffer only ever grows, so a snapshot of a stream is always an
/// extension of any earlier snapshot of the same stream.
#[derive(Debug)]
pub struct OutputSink {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Both streams in arrival order. Only for error messages.
    combined: Vec<u8>,
    rx: Receiver<OutputChunk>,
}

impl OutputSink {
    pub fn new(rx: Receiver<OutputChunk>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            combined: Vec::new(),
            rx,
        }
    }

    fn append(&mut self, (stream, chunk): OutputChunk) {
        match stream {
            StreamKind::Stdout => self.stdout.extend_from_slice(&chunk),
            StreamKind::Stderr => self.stderr.extend_from_slice(&chunk),
        }
        self.combined.extend_from_slice(&chunk);
    }

    /// Move every chunk that has already arrived into the buffers without
    /// waiting. Returns the number of bytes appended.
    pub fn drain(&mut self) -> usize {
        let before = self.combined.len();
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => self.append(chunk),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        self.combined.len() - before
    }

    /// Wait until every writer has hung up, appending everything received.
    ///
    /// Cancel-safe: chunks received before cancellation stay in the buffers.
    pub async fn drain_to_end(&mut self) {
        while let Some(chunk) = self.rx.recv().await {
            self.append(chunk);
        }
    }

    /// Everything one stream has written so far. Invalid UTF-8 is replaced.
    pub fn stream(&self, stream: StreamKind) -> Cow<'_, str> {
        match stream {
            StreamKind::Stdout => String::from_utf8_lossy(&self.stdout),
            StreamKind::Stderr => String::from_utf8_lossy(&self.stderr),
        }
    }

    /// `true` if `predicate` holds for the full text of either stream.
    pub fn any_stream(&self, predicate: impl Fn(&str) -> bool) -> bool {
        [StreamKind::Stdout, StreamKind::Stderr]
            .into_iter()
            .any(|stream| predicate(&self.stream(stream)))
    }

    /// The last `max_bytes` of output from both streams, for error messages.
    pub fn tail(&self, max_bytes: usize) -> String {
        let start = self.combined.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&self.combined[start..]).into_owned()
    }

    /// Hand the channel to a background task that discards output until the
    /// readers finish. Used once the server is up and nobody scans any more.
    pub fn spawn_discard(self) -> JoinHandle<()> {
        let mut rx = self.rx;
        tokio::spawn(async move { while rx.recv().await.is_some() {} })
    }
}
