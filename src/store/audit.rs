//! Asynchronous audit logging.
//!
//! Producers enqueue onto a bounded channel and return immediately; once the
//! channel is full, `enqueue` blocks, which is the backpressure bound on
//! memory under audit storms. A single consumer thread drains the channel in
//! batches, assigns gap-free sequence numbers from an atomic counter, and
//! parks the sequenced entries in a shared buffer the store merges into the
//! catalog at save time.
//!
//! Entry order is the order sends were accepted by the channel, which the
//! consumer preserves; sequence numbers therefore match acceptance order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::types::{AuditAction, AuditLogEntry};

enum AuditMessage {
    Entry {
        action: AuditAction,
        entity_uid: String,
        details: String,
    },
    Flush(Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct AuditShared {
    pending: Mutex<Vec<AuditLogEntry>>,
}

pub struct AuditQueue {
    tx: Sender<AuditMessage>,
    accepted: Arc<AtomicU64>,
    shared: Arc<AuditShared>,
    next_sequence: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl AuditQueue {
    /// Start the consumer. `first_sequence` continues the table's numbering;
    /// `accepted_so_far` continues the producer watermark from the catalog.
    pub fn start(
        first_sequence: u64,
        accepted_so_far: u64,
        capacity: usize,
        batch_limit: usize,
    ) -> Result<Self> {
        let (tx, rx) = bounded(capacity.max(1));
        let shared = Arc::new(AuditShared::default());
        let next_sequence = Arc::new(AtomicU64::new(first_sequence));

        let worker_shared = Arc::clone(&shared);
        let worker_sequence = Arc::clone(&next_sequence);
        let limit = batch_limit.max(1);
        let worker = std::thread::Builder::new()
            .name("radvault-audit".into())
            .spawn(move || run_consumer(&rx, &worker_shared, &worker_sequence, limit))?;

        Ok(Self {
            tx,
            accepted: Arc::new(AtomicU64::new(accepted_so_far)),
            shared,
            next_sequence,
            worker: Some(worker),
        })
    }

    /// Queue one entry. Blocks once the bounded channel is full.
    pub fn enqueue(
        &self,
        action: AuditAction,
        entity_uid: impl Into<String>,
        details: impl Into<String>,
    ) -> Result<()> {
        self.tx
            .send(AuditMessage::Entry {
                action,
                entity_uid: entity_uid.into(),
                details: details.into(),
            })
            .map_err(|_| StoreError::AuditQueue("consumer has shut down".into()))?;
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Total enqueues accepted over the store's lifetime. Persisted with
    /// every WAL envelope so unflushed entries are detectable after a crash.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Sequence the consumer will assign next.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Wait until everything enqueued before this call has been sequenced,
    /// then take the sequenced batch.
    pub fn drain(&self) -> Result<Vec<AuditLogEntry>> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(AuditMessage::Flush(ack_tx))
            .map_err(|_| StoreError::AuditQueue("consumer has shut down".into()))?;
        ack_rx
            .recv()
            .map_err(|_| StoreError::AuditQueue("consumer exited during flush".into()))?;
        Ok(std::mem::take(&mut *self.shared.pending.lock()))
    }

    /// Snapshot of sequenced-but-unsaved entries, for live inspection.
    #[must_use]
    pub fn pending_snapshot(&self) -> Vec<AuditLogEntry> {
        self.shared.pending.lock().clone()
    }

    /// Stop the consumer after it drains what is already queued.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(AuditMessage::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AuditQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AuditQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditQueue")
            .field("accepted", &self.accepted())
            .field("next_sequence", &self.next_sequence())
            .finish_non_exhaustive()
    }
}

fn run_consumer(
    rx: &Receiver<AuditMessage>,
    shared: &AuditShared,
    next_sequence: &AtomicU64,
    batch_limit: usize,
) {
    loop {
        let Ok(first) = rx.recv() else {
            return;
        };

        let mut staged: Vec<(AuditAction, String, String)> = Vec::new();
        let mut acks: Vec<Sender<()>> = Vec::new();
        let mut shutdown = false;
        stage_message(first, &mut staged, &mut acks, &mut shutdown);

        // Drain what is already queued, up to the batch limit. A flush ack
        // must fire only after everything ahead of it is sequenced, so a
        // flush also terminates the batch.
        while !shutdown && staged.len() < batch_limit && acks.is_empty() {
            match rx.try_recv() {
                Ok(message) => stage_message(message, &mut staged, &mut acks, &mut shutdown),
                Err(_) => break,
            }
        }
        if shutdown {
            // Everything already accepted still gets sequenced.
            while let Ok(message) = rx.try_recv() {
                let mut ignored = false;
                stage_message(message, &mut staged, &mut acks, &mut ignored);
            }
        }

        sequence_batch(shared, next_sequence, staged);
        for ack in acks {
            let _ = ack.send(());
        }
        if shutdown {
            return;
        }
    }
}

fn stage_message(
    message: AuditMessage,
    staged: &mut Vec<(AuditAction, String, String)>,
    acks: &mut Vec<Sender<()>>,
    shutdown: &mut bool,
) {
    match message {
        AuditMessage::Entry {
            action,
            entity_uid,
            details,
        } => staged.push((action, entity_uid, details)),
        AuditMessage::Flush(ack) => acks.push(ack),
        AuditMessage::Shutdown => *shutdown = true,
    }
}

fn sequence_batch(
    shared: &AuditShared,
    next_sequence: &AtomicU64,
    staged: Vec<(AuditAction, String, String)>,
) {
    if staged.is_empty() {
        return;
    }
    let timestamp = Utc::now().timestamp();
    let mut pending = shared.pending.lock();
    for (action, entity_uid, details) in staged {
        let sequence = next_sequence.fetch_add(1, Ordering::SeqCst);
        pending.push(AuditLogEntry {
            sequence,
            timestamp,
            action,
            entity_uid,
            details,
        });
    }
}
