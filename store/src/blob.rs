// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;

use protocol::Blob;

use crate::{Store, StoreError};


///
/// The inline-size ceiling: payloads whose wire rendering would reach this many bytes are
/// promoted to object-store references instead. Small blobs travel free inside the RPC payload;
/// large ones dedupe through the store.
///
pub const MAX_INLINE: usize = 10 * 1024;

fn base64_len(len: usize) -> usize {
    (len + 2) / 3 * 4
}

impl Store {
    ///
    /// Encode bytes as a `Blob`: inline UTF-8 when small, inline base64 when small after
    /// encoding, else a store reference.
    ///
    pub async fn store_blob(&self, bytes: Bytes) -> Result<Blob, StoreError> {
        if bytes.len() < MAX_INLINE {
            if let Ok(utf8) = std::str::from_utf8(&bytes) {
                return Ok(Blob::Inline(utf8.to_owned()));
            }
        }
        if base64_len(bytes.len()) < MAX_INLINE {
            return Ok(Blob::InlineBytes(bytes.to_vec()));
        }
        Ok(Blob::Ref(self.store_bytes(bytes).await?))
    }
}

///
/// The read half of the codec. A response assembler appends every blob it must materialise to
/// one `GetBatch`, issues a single batched store call, and then resolves each blob's source
/// against the results:
///
/// ```ignore
/// let mut batch = GetBatch::new();
/// let stdout = batch.append(&response.stdout);
/// let fetched = batch.fetch(&store).await;
/// let stdout_bytes = fetched.resolve(stdout)?;
/// ```
///
pub struct GetBatch {
    ids: Vec<hashing::ObjectId>,
}

///
/// Where one appended blob's bytes will come from.
///
pub enum BlobSource {
    Ready(Bytes),
    /// An index into the batched get.
    Fetch(usize),
    /// The blob carried a per-entry error message instead of content.
    Carried(String),
}

impl GetBatch {
    pub fn new() -> GetBatch {
        GetBatch { ids: Vec::new() }
    }

    pub fn append(&mut self, blob: &Blob) -> BlobSource {
        match blob {
            Blob::Inline(utf8) => BlobSource::Ready(Bytes::copy_from_slice(utf8.as_bytes())),
            Blob::InlineBytes(raw) => BlobSource::Ready(Bytes::copy_from_slice(raw)),
            Blob::Ref(id) => {
                self.ids.push(*id);
                BlobSource::Fetch(self.ids.len() - 1)
            }
            Blob::Err(message) => BlobSource::Carried(message.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    ///
    /// Issue the single batched get covering every appended reference.
    ///
    pub async fn fetch(self, store: &Store) -> FetchedBlobs {
        let results = store.get_batch(&self.ids).await;
        FetchedBlobs { results }
    }
}

pub struct FetchedBlobs {
    results: Vec<Result<Bytes, StoreError>>,
}

impl FetchedBlobs {
    pub fn resolve(&self, source: BlobSource) -> Result<Bytes, String> {
        match source {
            BlobSource::Ready(bytes) => Ok(bytes),
            BlobSource::Fetch(index) => self.results[index]
                .clone()
                .map_err(|e| e.to_string()),
            BlobSource::Carried(message) => Err(message),
        }
    }
}
