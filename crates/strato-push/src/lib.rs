//! Strato Push - streamed push of chunked payloads from a worker pool.
//!
//! The cloud store answers queries; bulk payloads travel the other way:
//! a sender enqueues a payload for a recipient and a pool of worker
//! threads streams it out in chunks. Per-recipient state is reference
//! counted, the recipient list is guarded by a single mutex, and
//! [`PushService::shutdown`] is a drain barrier: it returns only after
//! every queued push has been streamed or cancelled.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use strato_core::PeerGuid;
use thiserror::Error;
use tracing::{debug, warn};

/// Default chunk size streamed per sink call.
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;

/// Errors from the push service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The service is shutting down and accepts no new pushes.
    #[error("push service is shut down")]
    ShutDown,
}

/// One chunk of a streamed push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushChunk {
    /// Sender-chosen stream identifier.
    pub stream_id: u16,
    /// Byte offset of this chunk within the payload.
    pub offset: u64,
    /// Total payload length.
    pub total_len: u64,
    /// The chunk bytes.
    pub data: Bytes,
    /// True on the final chunk of the stream.
    pub is_last: bool,
}

/// Where chunks go.
///
/// Implemented over the transport in production and over a buffer in
/// tests. Returning `false` tells the worker the recipient is gone and
/// the rest of the stream should be dropped.
pub trait ChunkSink: Send + Sync {
    /// Delivers one chunk toward `recipient`.
    fn deliver(&self, recipient: PeerGuid, chunk: PushChunk) -> bool;
}

/// A queued payload awaiting streaming.
struct PendingPush {
    stream_id: u16,
    data: Bytes,
}

/// Per-recipient state, shared between the service and any worker
/// currently streaming to it.
struct Recipient {
    guid: PeerGuid,
    queue: Mutex<VecDeque<PendingPush>>,
    cancelled: AtomicBool,
}

impl Recipient {
    fn new(guid: PeerGuid) -> Self {
        Self {
            guid,
            queue: Mutex::new(VecDeque::new()),
            cancelled: AtomicBool::new(false),
        }
    }
}

struct Shared {
    sink: Arc<dyn ChunkSink>,
    chunk_bytes: usize,
    /// All live recipients. The single lock ordering rule: take this
    /// before any per-recipient queue lock.
    recipients: Mutex<Vec<Arc<Recipient>>>,
    /// Recipients with queued work, handed to workers in FIFO order.
    work: Mutex<VecDeque<Arc<Recipient>>>,
    work_available: Condvar,
    shutting_down: AtomicBool,
}

impl Shared {
    /// Streams every queued push of one recipient.
    fn drain_recipient(&self, recipient: &Arc<Recipient>) {
        loop {
            if recipient.cancelled.load(Ordering::Acquire) {
                recipient.queue.lock().clear();
                return;
            }
            let Some(pending) = recipient.queue.lock().pop_front() else {
                return;
            };
            self.stream_one(recipient, pending);
        }
    }

    fn stream_one(&self, recipient: &Arc<Recipient>, pending: PendingPush) {
        let total_len = pending.data.len() as u64;
        let mut offset = 0usize;

        loop {
            if recipient.cancelled.load(Ordering::Acquire) {
                debug!(recipient = %recipient.guid, stream = pending.stream_id,
                       "push cancelled mid-stream");
                return;
            }

            let end = (offset + self.chunk_bytes).min(pending.data.len());
            let is_last = end == pending.data.len();
            let chunk = PushChunk {
                stream_id: pending.stream_id,
                offset: offset as u64,
                total_len,
                data: pending.data.slice(offset..end),
                is_last,
            };
            if !self.sink.deliver(recipient.guid, chunk) {
                warn!(recipient = %recipient.guid, stream = pending.stream_id,
                      "sink refused chunk, dropping rest of stream");
                return;
            }
            if is_last {
                return;
            }
            offset = end;
        }
    }
}

/// A pool of worker threads streaming queued payloads to recipients.
pub struct PushService {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl PushService {
    /// Starts a pool of `worker_count` threads streaming `chunk_bytes`
    /// chunks into `sink`.
    pub fn new(worker_count: usize, chunk_bytes: usize, sink: Arc<dyn ChunkSink>) -> Self {
        assert!(worker_count > 0, "push pool needs at least one worker");
        assert!(chunk_bytes > 0, "chunk size must be non-zero");

        let shared = Arc::new(Shared {
            sink,
            chunk_bytes,
            recipients: Mutex::new(Vec::new()),
            work: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        });

        let workers = (0..worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("strato-push-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn push worker")
            })
            .collect();

        Self { shared, workers }
    }

    /// Queues `data` for streaming to `recipient`.
    pub fn send(&self, recipient: PeerGuid, stream_id: u16, data: Bytes) -> Result<(), PushError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(PushError::ShutDown);
        }

        let entry = {
            let mut recipients = self.shared.recipients.lock();
            match recipients.iter().find(|r| r.guid == recipient) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let fresh = Arc::new(Recipient::new(recipient));
                    recipients.push(Arc::clone(&fresh));
                    fresh
                }
            }
        };

        entry.queue.lock().push_back(PendingPush { stream_id, data });

        let mut work = self.shared.work.lock();
        work.push_back(entry);
        drop(work);
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Cancels everything queued or streaming toward `recipient`.
    ///
    /// Call on disconnect. A worker mid-stream observes the cancellation
    /// at its next chunk boundary; the recipient state itself is freed
    /// when the last worker handle drops.
    pub fn remove_recipient(&self, recipient: PeerGuid) {
        let removed = {
            let mut recipients = self.shared.recipients.lock();
            let before = recipients.len();
            recipients.retain(|r| {
                if r.guid == recipient {
                    r.cancelled.store(true, Ordering::Release);
                    r.queue.lock().clear();
                    false
                } else {
                    true
                }
            });
            before != recipients.len()
        };
        if removed {
            debug!(recipient = %recipient, "push recipient removed");
        }
    }

    /// Number of live recipients.
    pub fn recipient_count(&self) -> usize {
        self.shared.recipients.lock().len()
    }

    /// Drain barrier: streams out all queued work, then joins the pool.
    pub fn shutdown(mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for PushService {
    fn drop(&mut self) {
        // A dropped service still drains: workers exit once the queue
        // empties after the flag is raised.
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let recipient = {
            let mut work = shared.work.lock();
            loop {
                if let Some(recipient) = work.pop_front() {
                    break Some(recipient);
                }
                if shared.shutting_down.load(Ordering::Acquire) {
                    break None;
                }
                shared.work_available.wait(&mut work);
            }
        };

        let Some(recipient) = recipient else {
            return;
        };
        shared.drain_recipient(&recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct BufferSink {
        chunks: PlMutex<Vec<(PeerGuid, PushChunk)>>,
    }

    impl ChunkSink for BufferSink {
        fn deliver(&self, recipient: PeerGuid, chunk: PushChunk) -> bool {
            self.chunks.lock().push((recipient, chunk));
            true
        }
    }

    #[test]
    fn payload_is_chunked_and_reassembles() {
        let sink = Arc::new(BufferSink::default());
        let service = PushService::new(2, 4, sink.clone());
        let recipient = PeerGuid::new(1);

        service
            .send(recipient, 7, Bytes::from_static(b"abcdefghij"))
            .unwrap();
        service.shutdown();

        let chunks = sink.chunks.lock();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|(to, _)| *to == recipient));
        assert!(chunks.last().unwrap().1.is_last);
        assert!(chunks[..2].iter().all(|(_, c)| !c.is_last));

        let mut assembled = Vec::new();
        for (_, chunk) in chunks.iter() {
            assert_eq!(chunk.offset as usize, assembled.len());
            assert_eq!(chunk.total_len, 10);
            assert_eq!(chunk.stream_id, 7);
            assembled.extend_from_slice(&chunk.data);
        }
        assert_eq!(assembled, b"abcdefghij");
    }

    #[test]
    fn empty_payload_still_sends_final_chunk() {
        let sink = Arc::new(BufferSink::default());
        let service = PushService::new(1, 4, sink.clone());

        service.send(PeerGuid::new(1), 0, Bytes::new()).unwrap();
        service.shutdown();

        let chunks = sink.chunks.lock();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].1.is_last);
        assert_eq!(chunks[0].1.total_len, 0);
    }

    #[test]
    fn shutdown_drains_all_recipients() {
        let sink = Arc::new(BufferSink::default());
        let service = PushService::new(3, 8, sink.clone());

        for guid in 1..=5u64 {
            service
                .send(PeerGuid::new(guid), 0, Bytes::from_static(b"0123456789abcdef"))
                .unwrap();
        }
        service.shutdown();

        let chunks = sink.chunks.lock();
        // 16 bytes in 8-byte chunks: two per recipient.
        assert_eq!(chunks.len(), 10);
        for guid in 1..=5u64 {
            assert_eq!(
                chunks.iter().filter(|(to, _)| *to == PeerGuid::new(guid)).count(),
                2
            );
        }
    }

    #[test]
    fn send_after_shutdown_flag_is_rejected() {
        let sink = Arc::new(BufferSink::default());
        let service = PushService::new(1, 4, sink);
        service
            .shared
            .shutting_down
            .store(true, Ordering::Release);
        assert_eq!(
            service.send(PeerGuid::new(1), 0, Bytes::from_static(b"x")),
            Err(PushError::ShutDown)
        );
    }

    #[test]
    fn removed_recipient_receives_nothing_new() {
        let sink = Arc::new(BufferSink::default());
        let service = PushService::new(1, 4, sink.clone());
        let recipient = PeerGuid::new(1);

        service.remove_recipient(recipient); // not present: no-op
        assert_eq!(service.recipient_count(), 0);

        service.send(recipient, 0, Bytes::from_static(b"abc")).unwrap();
        service.shutdown();
        assert_eq!(sink.chunks.lock().len(), 1);
    }

    struct RefusingSink;

    impl ChunkSink for RefusingSink {
        fn deliver(&self, _recipient: PeerGuid, _chunk: PushChunk) -> bool {
            false
        }
    }

    #[test]
    fn refused_stream_is_dropped_not_retried() {
        let service = PushService::new(1, 4, Arc::new(RefusingSink));
        service
            .send(PeerGuid::new(1), 0, Bytes::from_static(b"abcdefgh"))
            .unwrap();
        // Drain barrier returning proves the worker gave up on the stream.
        service.shutdown();
    }
}
