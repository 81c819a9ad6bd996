// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-digest fetch serialization.
//!
//! Concurrent pulls of the same blob must hit the network once: the first
//! caller downloads while the rest block on the digest's lock, then find
//! the layer already registered. Entries are reference counted and removed
//! at the last release so the map does not grow without bound.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

struct Entry {
    busy: Mutex<bool>,
    cond: Condvar,
}

struct EntryRef {
    entry: Arc<Entry>,
    // holders plus waiters; the entry is dropped from the map at zero
    refs: usize,
}

#[derive(Default)]
pub struct FetchLock {
    entries: Mutex<HashMap<String, EntryRef>>,
}

impl FetchLock {
    pub fn new() -> Self {
        FetchLock::default()
    }

    /// Block until the lock for `key` is free, then hold it until the
    /// returned guard drops.
    pub fn acquire(&self, key: &str) -> FetchLockGuard<'_> {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            let entry_ref = entries.entry(key.to_string()).or_insert_with(|| EntryRef {
                entry: Arc::new(Entry {
                    busy: Mutex::new(false),
                    cond: Condvar::new(),
                }),
                refs: 0,
            });
            entry_ref.refs += 1;
            entry_ref.entry.clone()
        };

        let mut busy = entry.busy.lock().unwrap();
        while *busy {
            busy = entry.cond.wait(busy).unwrap();
        }
        *busy = true;
        drop(busy);

        FetchLockGuard {
            lock: self,
            key: key.to_string(),
        }
    }

    fn release(&self, key: &str) {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(key) {
                Some(entry_ref) => {
                    entry_ref.refs -= 1;
                    let entry = entry_ref.entry.clone();
                    if entry_ref.refs == 0 {
                        entries.remove(key);
                    }
                    entry
                }
                None => {
                    warn!("release of unknown fetch lock {}", key);
                    return;
                }
            }
        };

        let mut busy = entry.busy.lock().unwrap();
        *busy = false;
        entry.cond.notify_one();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

pub struct FetchLockGuard<'a> {
    lock: &'a FetchLock,
    key: String,
}

impl<'a> Drop for FetchLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_is_mutually_exclusive() {
        let lock = Arc::new(FetchLock::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(thread::spawn(move || {
                let _guard = lock.acquire("digest-a");
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_keys_do_not_block_each_other() {
        let lock = Arc::new(FetchLock::new());
        let _guard_a = lock.acquire("digest-a");

        let (tx, rx) = mpsc::channel();
        let lock2 = lock.clone();
        thread::spawn(move || {
            let _guard_b = lock2.acquire("digest-b");
            tx.send(()).unwrap();
        });

        // would time out if "digest-b" were serialized behind "digest-a"
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_entries_are_removed_after_the_final_release() {
        let lock = FetchLock::new();
        {
            let _guard = lock.acquire("digest-a");
            assert_eq!(lock.len(), 1);
        }
        assert_eq!(lock.len(), 0);
    }

    #[test]
    fn test_waiters_keep_the_entry_alive() {
        let lock = Arc::new(FetchLock::new());
        let guard = lock.acquire("digest-a");

        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            let _guard = lock2.acquire("digest-a");
        });

        // give the waiter time to queue up, then hand over
        thread::sleep(Duration::from_millis(20));
        assert_eq!(lock.len(), 1);
        drop(guard);

        handle.join().unwrap();
        assert_eq!(lock.len(), 0);
    }
}
