// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use hashing::ObjectId;


///
/// An in-process record of ids whose payload has already reached the remote store, plus the
/// uploads currently in flight.
///
/// `reserve` hands the first caller for an id an `UploadToken`; concurrent callers for the same
/// id wait on the token's completion. Completing the token records the id as stored; dropping
/// it without completing rolls the reservation back and wakes the waiters so that one of them
/// can retry. An id is therefore never observable as stored unless some upload of it succeeded.
///
#[derive(Clone)]
pub struct WriteDedup {
    inner: Arc<Mutex<HashMap<ObjectId, Entry>>>,
}

enum Entry {
    Stored,
    // Waiters hold the receiver; the sender lives in the UploadToken and is dropped (waking
    // them) on both completion and rollback.
    InFlight(watch::Receiver<()>),
}

pub enum Reservation {
    AlreadyStored,
    Upload(UploadToken),
}

impl WriteDedup {
    pub fn new() -> WriteDedup {
        WriteDedup {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn reserve(&self, id: ObjectId) -> Reservation {
        loop {
            let mut receiver = {
                let mut inner = self.inner.lock();
                match inner.get(&id) {
                    Some(Entry::Stored) => return Reservation::AlreadyStored,
                    Some(Entry::InFlight(receiver)) => receiver.clone(),
                    None => {
                        let (sender, receiver) = watch::channel(());
                        inner.insert(id, Entry::InFlight(receiver));
                        return Reservation::Upload(UploadToken {
                            id,
                            inner: self.inner.clone(),
                            sender: Some(sender),
                        });
                    }
                }
            };
            // Wait for the in-flight upload's sender to drop, then re-check: the entry is now
            // either Stored (skip) or gone (retry the reservation).
            while receiver.changed().await.is_ok() {}
        }
    }

    ///
    /// Whether the id is currently recorded as stored. Test-only observability.
    ///
    #[cfg(test)]
    pub fn is_stored(&self, id: ObjectId) -> bool {
        matches!(self.inner.lock().get(&id), Some(Entry::Stored))
    }
}

#[must_use]
pub struct UploadToken {
    id: ObjectId,
    inner: Arc<Mutex<HashMap<ObjectId, Entry>>>,
    sender: Option<watch::Sender<()>>,
}

impl UploadToken {
    ///
    /// Record the upload as successful. Callers must only invoke this after the store
    /// acknowledged the write.
    ///
    pub fn complete(mut self) {
        self.inner.lock().insert(self.id, Entry::Stored);
        // Dropping the sender releases the waiters, who will observe Stored.
        self.sender.take();
    }
}

impl Drop for UploadToken {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            // Not completed: roll back so a later attempt can upload. The entry is removed
            // before the sender drops, so woken waiters observe the rollback.
            self.inner.lock().remove(&self.id);
            drop(sender);
        }
    }
}
