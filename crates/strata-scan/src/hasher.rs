//! Content hashing with a bounded worker pool.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use blake3::Hasher;
use crossbeam_channel::{self as channel, Receiver, Sender, TrySendError};
use strata_core::{ContentHash, EntryId};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Stream a file through BLAKE3 using a fixed-size buffer.
///
/// Returns the digest and the number of bytes read.
pub fn hash_file(path: &Path) -> io::Result<(ContentHash, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((ContentHash::new(*hasher.finalize().as_bytes()), total))
}

/// A file waiting to be hashed.
#[derive(Debug, Clone)]
pub struct HashJob {
    pub id: EntryId,
    pub path: PathBuf,
}

/// Result of one hashing job.
#[derive(Debug)]
pub enum HashOutcome {
    Hashed {
        id: EntryId,
        hash: ContentHash,
        bytes: u64,
    },
    Failed {
        id: EntryId,
        path: PathBuf,
        error: io::Error,
    },
}

/// What [`HashingEngine::digest`] did with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    /// The stored hash is still valid; nothing was read.
    Cached(ContentHash),
    /// The file was queued; its outcome arrives through the result channel.
    Queued,
}

/// Bounded pool of hashing threads.
///
/// Jobs go through a bounded queue so a slow disk pushes back on the walk.
/// Results come back on an unbounded channel drained by the walk, which
/// stays the only writer to the store.
pub struct HashingEngine {
    job_tx: Option<Sender<HashJob>>,
    job_rx: Receiver<HashJob>,
    result_rx: Receiver<HashOutcome>,
    workers: Vec<JoinHandle<()>>,
}

impl HashingEngine {
    /// Start `workers` hashing threads behind a queue of `queue_depth` jobs.
    pub fn new(workers: usize, queue_depth: usize) -> io::Result<Self> {
        let (job_tx, job_rx) = channel::bounded::<HashJob>(queue_depth.max(1));
        let (result_tx, result_rx) = channel::unbounded::<HashOutcome>();

        let workers = (0..workers.max(1))
            .map(|i| {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("strata-hash-{i}"))
                    .spawn(move || hash_worker(&job_rx, &result_tx))
            })
            .collect::<io::Result<Vec<_>>>()?;

        debug!(workers = workers.len(), queue_depth, "Started hashing pool");
        Ok(Self {
            job_tx: Some(job_tx),
            job_rx,
            result_rx,
            workers,
        })
    }

    /// Reuse `cached` when present, otherwise queue the file.
    ///
    /// When the queue is full, `before_block` runs once before the call
    /// blocks waiting for a free slot.
    pub fn digest<E>(
        &self,
        job: HashJob,
        cached: Option<ContentHash>,
        before_block: impl FnOnce() -> Result<(), E>,
    ) -> Result<Digest, E> {
        if let Some(hash) = cached {
            return Ok(Digest::Cached(hash));
        }
        let Some(tx) = &self.job_tx else {
            return Ok(Digest::Queued);
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                before_block()?;
                // Workers hold the receiver until the engine is dropped.
                let _ = tx.send(job);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
        Ok(Digest::Queued)
    }

    /// Outcomes available right now, without blocking.
    pub fn completed(&self) -> impl Iterator<Item = HashOutcome> + '_ {
        self.result_rx.try_iter()
    }

    /// Drop queued jobs that no worker has started. Returns how many.
    pub fn cancel_pending(&self) -> usize {
        self.job_rx.try_iter().count()
    }

    /// Close the queue, wait for the workers and return the remaining outcomes.
    pub fn finish(mut self) -> Vec<HashOutcome> {
        self.shutdown();
        self.result_rx.try_iter().collect()
    }

    fn shutdown(&mut self) {
        self.job_tx = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Hashing worker panicked");
            }
        }
    }
}

impl Drop for HashingEngine {
    fn drop(&mut self) {
        self.cancel_pending();
        self.shutdown();
    }
}

fn hash_worker(jobs: &Receiver<HashJob>, results: &Sender<HashOutcome>) {
    for job in jobs.iter() {
        let outcome = match hash_file(&job.path) {
            Ok((hash, bytes)) => HashOutcome::Hashed {
                id: job.id,
                hash,
                bytes,
            },
            Err(error) => HashOutcome::Failed {
                id: job.id,
                path: job.path,
                error,
            },
        };
        if results.send(outcome).is_err() {
            return;
        }
    }
}
