//! Bounded byte handoff between the download and upload stages.
//!
//! A single-producer single-consumer chunk pipe whose capacity is counted in
//! bytes. The producer blocks once `capacity` bytes are buffered; the
//! consumer blocks when the pipe is empty. Clips larger than the buffer
//! stream through it as the consumer drains concurrently. Closing the writer
//! signals EOF; [`ClipWriter::fail`] closes it with an error the reader
//! observes in-band, so a failed download can never be mistaken for a
//! complete clip.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

const CHUNK_SLOTS: usize = 1024;

enum Message {
    Chunk(Bytes),
    Failed(String),
}

/// Create a clip pipe holding at most `capacity` buffered bytes.
pub fn clip_pipe(capacity: usize) -> (ClipWriter, ClipReader) {
    let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
    let (tx, rx) = mpsc::channel(CHUNK_SLOTS);
    let sem = Arc::new(Semaphore::new(capacity));
    let buffered = Arc::new(AtomicUsize::new(0));

    (
        ClipWriter {
            tx,
            sem: sem.clone(),
            capacity,
            buffered: buffered.clone(),
        },
        ClipReader {
            rx,
            sem,
            capacity,
            buffered,
        },
    )
}

/// Producer half, held by the download stage.
pub struct ClipWriter {
    tx: mpsc::Sender<Message>,
    sem: Arc<Semaphore>,
    capacity: usize,
    buffered: Arc<AtomicUsize>,
}

impl ClipWriter {
    /// Send one chunk, waiting for buffer space. A chunk larger than the
    /// whole buffer is admitted once `capacity` bytes are free so oversized
    /// reads still make progress.
    pub async fn send(&self, chunk: Bytes) -> Result<(), PipeClosed> {
        if chunk.is_empty() {
            return Ok(());
        }

        let charge = chunk.len().min(self.capacity);
        let permits = self
            .sem
            .acquire_many(charge as u32)
            .await
            .map_err(|_| PipeClosed)?;
        permits.forget();
        self.buffered.fetch_add(charge, Ordering::Relaxed);

        if self.tx.send(Message::Chunk(chunk)).await.is_err() {
            return Err(PipeClosed);
        }
        Ok(())
    }

    /// Close the pipe flagging a failed download. The reader sees the error
    /// after any already-buffered chunks.
    pub async fn fail(self, reason: String) {
        // If the reader is gone the job was already abandoned.
        let _ = self.tx.send(Message::Failed(reason)).await;
    }

    /// Close the pipe signalling a complete clip.
    pub fn finish(self) {}
}

/// Consumer half, held by the upload stage.
pub struct ClipReader {
    rx: mpsc::Receiver<Message>,
    sem: Arc<Semaphore>,
    capacity: usize,
    buffered: Arc<AtomicUsize>,
}

impl ClipReader {
    /// Receive the next chunk. `None` is clean EOF; `Some(Err(_))` is a
    /// failed download and terminates the stream.
    pub async fn recv(&mut self) -> Option<Result<Bytes, String>> {
        match self.rx.recv().await? {
            Message::Chunk(chunk) => {
                let charge = chunk.len().min(self.capacity);
                self.buffered.fetch_sub(charge, Ordering::Relaxed);
                self.sem.add_permits(charge);
                Some(Ok(chunk))
            }
            Message::Failed(reason) => Some(Err(reason)),
        }
    }

    /// Bytes currently buffered in the pipe.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }
}

/// The other half of the pipe was dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct PipeClosed;

impl std::fmt::Display for PipeClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clip pipe closed")
    }
}

impl std::error::Error for PipeClosed {}
