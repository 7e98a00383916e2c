// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

/// Keys waiting to be sent together, each with the epoch its fetch was armed at.
#[derive(Debug)]
pub(super) struct PendingBatch<K> {
    pub id: u64,
    pub keys: Vec<(K, u64)>,
}

#[derive(Debug)]
pub(super) enum Enqueued<K> {
    /// The key opened a new batch. The caller must flush batch `id` after the window.
    Opened { id: u64 },
    /// The key joined the open batch.
    Queued,
    /// The key filled the batch, which must be dispatched now.
    Full(PendingBatch<K>),
}

/// The batch currently collecting keys.
///
/// A key is only queued when its entry becomes pending, so a batch never holds the same
/// key twice.
pub(super) struct BatchQueue<K> {
    max_batch_size: usize,
    next_id: u64,
    open: Option<PendingBatch<K>>,
}

impl<K> BatchQueue<K> {
    pub fn new(max_batch_size: usize) -> Self {
        assert!(max_batch_size > 0, "batches must hold at least one key");
        Self {
            max_batch_size,
            next_id: 0,
            open: None,
        }
    }

    pub fn push(&mut self, key: K, epoch: u64) -> Enqueued<K> {
        let mut opened = None;
        let batch = self.open.get_or_insert_with(|| {
            let id = self.next_id;
            self.next_id += 1;
            opened = Some(id);
            PendingBatch {
                id,
                keys: Vec::new(),
            }
        });
        batch.keys.push((key, epoch));
        if batch.keys.len() >= self.max_batch_size {
            if let Some(batch) = self.open.take() {
                return Enqueued::Full(batch);
            }
        }
        match opened {
            Some(id) => Enqueued::Opened { id },
            None => Enqueued::Queued,
        }
    }

    /// Takes the batch `id` if it is still collecting keys.
    pub fn take(&mut self, id: u64) -> Option<PendingBatch<K>> {
        if self.open.as_ref()?.id != id {
            return None;
        }
        self.open.take()
    }
}
