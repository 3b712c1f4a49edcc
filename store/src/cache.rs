// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use parking_lot::Mutex;

use hashing::ObjectId;


///
/// A size-bounded compressed on-disk cache in front of the object store, intercepting reads
/// only: writes pass through the store unmodified.
///
/// Layout is `{root}/{id[0:2]}/{id[2:]}` with Snappy-compressed payloads. Recency is tracked by
/// an arena-backed doubly-linked list so that moves and removals are O(1); accounting uses
/// uncompressed payload sizes. When the total exceeds `max_bytes`, entries are pruned from the
/// tail. An object larger than `max_bytes` is never written at all.
///
pub struct DiskCache {
    root: PathBuf,
    max_bytes: u64,
    lru: Mutex<Lru>,
}

impl DiskCache {
    pub fn new(root: PathBuf, max_bytes: u64) -> Result<DiskCache, String> {
        fs::create_dir_all(&root)
            .map_err(|e| format!("failed to create cache root {}: {e}", root.display()))?;
        let cache = DiskCache {
            root,
            max_bytes,
            lru: Mutex::new(Lru::new()),
        };
        cache.scan_existing()?;
        Ok(cache)
    }

    ///
    /// Seed the recency list from files left by a previous process, in arbitrary order.
    ///
    fn scan_existing(&self) -> Result<(), String> {
        let mut lru = self.lru.lock();
        let shards = fs::read_dir(&self.root)
            .map_err(|e| format!("failed to list cache root {}: {e}", self.root.display()))?;
        for shard in shards.flatten() {
            let prefix = shard.file_name().to_string_lossy().into_owned();
            let Ok(entries) = fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let rest = entry.file_name().to_string_lossy().into_owned();
                let Ok(id) = ObjectId::from_hex_string(&format!("{prefix}{rest}")) else {
                    log::debug!("removing unrecognized cache file {:?}", entry.path());
                    let _ = fs::remove_file(entry.path());
                    continue;
                };
                let size = fs::read(entry.path())
                    .ok()
                    .and_then(|compressed| snap::raw::decompress_len(&compressed).ok());
                match size {
                    Some(size) => lru.insert(id, size as u64),
                    None => {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
        for id in lru.evict_over(self.max_bytes) {
            let _ = fs::remove_file(self.file_path(id));
        }
        Ok(())
    }

    fn file_path(&self, id: ObjectId) -> PathBuf {
        self.root.join(id.prefix()).join(id.rest())
    }

    ///
    /// Fetch a cached object, marking it most recently used. A file that fails to read or
    /// decompress is dropped from the cache and reported as a miss.
    ///
    pub fn get(&self, id: ObjectId) -> Option<Bytes> {
        if !self.lru.lock().touch(id) {
            return None;
        }

        let path = self.file_path(id);
        let decompressed = fs::read(&path)
            .ok()
            .and_then(|compressed| snap::raw::Decoder::new().decompress_vec(&compressed).ok());
        match decompressed {
            Some(bytes) => Some(Bytes::from(bytes)),
            None => {
                log::warn!("dropping unreadable cache entry {}", path.display());
                self.lru.lock().remove(id);
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    ///
    /// Insert an object fetched from upstream. Inserting prunes least-recently-used entries
    /// until the cache is back within its byte budget; an object larger than the whole budget
    /// never reaches disk, and pruning around it leaves the cache empty.
    ///
    pub fn put(&self, id: ObjectId, bytes: &Bytes) {
        let size = bytes.len() as u64;
        if size <= self.max_bytes {
            let path = self.file_path(id);
            if let Err(e) = self.write_compressed(&path, bytes) {
                log::warn!("failed to write cache entry {}: {e}", path.display());
                return;
            }
        }

        let evicted = {
            let mut lru = self.lru.lock();
            lru.insert(id, size);
            lru.evict_over(self.max_bytes)
        };
        for id in evicted {
            let _ = fs::remove_file(self.file_path(id));
        }
    }

    fn write_compressed(&self, path: &std::path::Path, bytes: &Bytes) -> Result<(), String> {
        let parent = path.parent().expect("cache paths always have a parent");
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(bytes)
            .map_err(|e| e.to_string())?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| e.to_string())?;
        tmp.write_all(&compressed).map_err(|e| e.to_string())?;
        tmp.persist(path).map_err(|e| e.to_string())?;
        Ok(())
    }

    ///
    /// The total uncompressed bytes currently accounted for. Test-only observability.
    ///
    pub fn total_bytes(&self) -> u64 {
        self.lru.lock().total_bytes
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.lru.lock().index.contains_key(&id)
    }
}

const NIL: usize = usize::MAX;

struct Node {
    id: ObjectId,
    size: u64,
    prev: usize,
    next: usize,
}

///
/// An arena-backed doubly-linked recency list: `nodes[0]` is a sentinel whose `next` is the
/// most recently used entry and whose `prev` is the eviction candidate.
///
struct Lru {
    nodes: Vec<Node>,
    free: Vec<usize>,
    index: std::collections::HashMap<ObjectId, usize>,
    total_bytes: u64,
}

impl Lru {
    fn new() -> Lru {
        let sentinel = Node {
            id: hashing::EMPTY_OBJECT_ID,
            size: 0,
            prev: 0,
            next: 0,
        };
        Lru {
            nodes: vec![sentinel],
            free: Vec::new(),
            index: std::collections::HashMap::new(),
            total_bytes: 0,
        }
    }

    fn unlink(&mut self, at: usize) {
        let (prev, next) = (self.nodes[at].prev, self.nodes[at].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn link_front(&mut self, at: usize) {
        let first = self.nodes[0].next;
        self.nodes[at].prev = 0;
        self.nodes[at].next = first;
        self.nodes[first].prev = at;
        self.nodes[0].next = at;
    }

    fn insert(&mut self, id: ObjectId, size: u64) {
        if self.touch(id) {
            return;
        }
        let node = Node {
            id,
            size,
            prev: NIL,
            next: NIL,
        };
        let at = match self.free.pop() {
            Some(at) => {
                self.nodes[at] = node;
                at
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.link_front(at);
        self.index.insert(id, at);
        self.total_bytes += size;
        self.check_consistency();
    }

    /// Mark an entry most recently used, returning whether it was present.
    fn touch(&mut self, id: ObjectId) -> bool {
        let Some(&at) = self.index.get(&id) else {
            return false;
        };
        self.unlink(at);
        self.link_front(at);
        self.check_consistency();
        true
    }

    fn remove(&mut self, id: ObjectId) {
        let Some(at) = self.index.remove(&id) else {
            return;
        };
        self.unlink(at);
        self.total_bytes -= self.nodes[at].size;
        self.free.push(at);
        self.check_consistency();
    }

    /// Pop tail entries until the total is within `max_bytes`, returning the evicted ids.
    fn evict_over(&mut self, max_bytes: u64) -> Vec<ObjectId> {
        let mut evicted = Vec::new();
        while self.total_bytes > max_bytes {
            let tail = self.nodes[0].prev;
            debug_assert_ne!(tail, 0, "over budget with an empty list");
            let id = self.nodes[tail].id;
            self.remove(id);
            evicted.push(id);
        }
        evicted
    }

    ///
    /// Debug-build verification that the list is cyclic, mirrors the index, and that the byte
    /// accounting matches the entries.
    ///
    fn check_consistency(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut seen = 0usize;
        let mut bytes = 0u64;
        let mut at = self.nodes[0].next;
        while at != 0 {
            let node = &self.nodes[at];
            assert_eq!(self.nodes[node.next].prev, at);
            assert_eq!(self.index.get(&node.id), Some(&at));
            seen += 1;
            bytes += node.size;
            at = node.next;
        }
        assert_eq!(self.nodes[self.nodes[0].prev].next, 0);
        assert_eq!(seen, self.index.len());
        assert_eq!(bytes, self.total_bytes);
    }
}
