//! Opaque 64-bit handles for in-process objects.
//!
//! The kernel refers to inodes and open files by 64-bit numbers that must
//! stay valid across request boundaries. A `HandleMap` hands such numbers
//! out and turns them back into objects, with a check word folded into the
//! upper bits so a corrupted or forged handle is caught instead of silently
//! decoding to the wrong object.
//!
//! Two modes exist. The indexed ("portable") mode keys a backing table by a
//! reused slot index. The pointer mode derives the handle from the object's
//! address, which requires the address to be machine-word aligned and to fit
//! the platform's effective 48 address bits; violations are programming
//! errors and panic. Both modes decode through the table, so the mode is a
//! handle-layout choice, not a safety one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// How handles are derived from objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleMode {
    /// Handle = slot index, cross-architecture safe.
    #[default]
    Indexed,
    /// Handle = object address. Requires aligned 48-bit addresses.
    Pointer,
}

const PAYLOAD_BITS: u32 = 48;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;
// 15 check bits keep the sign bit clear; zero is excluded so a live handle
// can never collide with FUSE_ROOT_ID or 0.
const CHECK_MASK: u64 = 0x7fff;

fn split(handle: u64) -> (u64, u64) {
    (handle & PAYLOAD_MASK, handle >> PAYLOAD_BITS)
}

fn pointer_payload(addr: usize) -> u64 {
    assert!(
        addr % std::mem::size_of::<usize>() == 0,
        "registering unaligned pointer {addr:#x}"
    );
    assert!(
        (addr as u64) <= PAYLOAD_MASK,
        "pointer {addr:#x} exceeds {PAYLOAD_BITS} address bits"
    );
    addr as u64
}

struct Entry<T> {
    obj: Arc<T>,
    check: u64,
    count: u64,
}

struct Inner<T> {
    slots: Vec<Option<Entry<T>>>,
    free_slots: Vec<usize>,
    by_payload: HashMap<u64, Entry<T>>,
    by_addr: HashMap<usize, u64>,
    next_check: u64,
    live: usize,
}

/// Bijection between 64-bit handles and live `Arc<T>` registrations.
pub(crate) struct HandleMap<T> {
    mode: HandleMode,
    inner: Mutex<Inner<T>>,
}

impl<T> HandleMap<T> {
    pub(crate) fn new(mode: HandleMode) -> Self {
        HandleMap {
            mode,
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free_slots: Vec::new(),
                by_payload: HashMap::new(),
                by_addr: HashMap::new(),
                next_check: 0,
                live: 0,
            }),
        }
    }

    /// Assign a fresh handle to `obj`. Registering the same object twice is
    /// an accounting bug and panics.
    pub(crate) fn register(&self, obj: &Arc<T>) -> u64 {
        let addr = Arc::as_ptr(obj) as usize;
        let mut inner = self.inner.lock();
        assert!(
            !inner.by_addr.contains_key(&addr),
            "double registration of object {addr:#x}"
        );
        inner.next_check = (inner.next_check + 1) & CHECK_MASK;
        if inner.next_check == 0 {
            inner.next_check = 1;
        }
        let check = inner.next_check;
        let entry = Entry {
            obj: obj.clone(),
            check,
            count: 1,
        };
        let payload = match self.mode {
            HandleMode::Pointer => {
                let payload = pointer_payload(addr);
                inner.by_payload.insert(payload, entry);
                payload
            }
            HandleMode::Indexed => {
                let idx = match inner.free_slots.pop() {
                    Some(idx) => {
                        inner.slots[idx] = Some(entry);
                        idx
                    }
                    None => {
                        inner.slots.push(Some(entry));
                        inner.slots.len() - 1
                    }
                };
                idx as u64
            }
        };
        let handle = payload | (check << PAYLOAD_BITS);
        inner.by_addr.insert(addr, handle);
        inner.live += 1;
        handle
    }

    /// Return the object registered under `handle`. Unknown handles and
    /// check-word mismatches are library bugs and panic.
    pub(crate) fn decode(&self, handle: u64) -> Arc<T> {
        let (payload, check) = split(handle);
        let inner = self.inner.lock();
        let entry = match self.mode {
            HandleMode::Pointer => inner.by_payload.get(&payload),
            HandleMode::Indexed => inner
                .slots
                .get(payload as usize)
                .and_then(|slot| slot.as_ref()),
        };
        match entry {
            Some(entry) if entry.check == check => entry.obj.clone(),
            Some(_) => panic!("handle {handle:#x} check word mismatch"),
            None => panic!("decode of unknown handle {handle:#x}"),
        }
    }

    /// Drop `count` references from the registration. When the count hits
    /// zero the entry is removed and `true` is returned along with the
    /// object.
    pub(crate) fn forget(&self, handle: u64, count: u64) -> (bool, Arc<T>) {
        let (payload, check) = split(handle);
        let mut inner = self.inner.lock();
        let entry = match self.mode {
            HandleMode::Pointer => inner.by_payload.get_mut(&payload),
            HandleMode::Indexed => inner
                .slots
                .get_mut(payload as usize)
                .and_then(|slot| slot.as_mut()),
        };
        let entry = match entry {
            Some(entry) if entry.check == check => entry,
            _ => panic!("forget of unknown handle {handle:#x}"),
        };
        entry.count = entry.count.saturating_sub(count);
        if entry.count > 0 {
            return (false, entry.obj.clone());
        }
        let entry = match self.mode {
            HandleMode::Pointer => inner.by_payload.remove(&payload).unwrap(),
            HandleMode::Indexed => {
                let idx = payload as usize;
                inner.free_slots.push(idx);
                inner.slots[idx].take().unwrap()
            }
        };
        inner.by_addr.remove(&(Arc::as_ptr(&entry.obj) as usize));
        inner.live -= 1;
        (true, entry.obj)
    }

    /// Number of live registrations.
    pub(crate) fn count(&self) -> usize {
        self.inner.lock().live
    }

    /// Liveness check without decoding.
    pub(crate) fn has(&self, handle: u64) -> bool {
        let (payload, check) = split(handle);
        let inner = self.inner.lock();
        let entry = match self.mode {
            HandleMode::Pointer => inner.by_payload.get(&payload),
            HandleMode::Indexed => inner
                .slots
                .get(payload as usize)
                .and_then(|slot| slot.as_ref()),
        };
        matches!(entry, Some(entry) if entry.check == check)
    }
}

impl<T> std::fmt::Debug for HandleMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleMap")
            .field("mode", &self.mode)
            .field("live", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_decode_round_trip() {
        for mode in [HandleMode::Indexed, HandleMode::Pointer] {
            let map = HandleMap::new(mode);
            let obj = Arc::new("hello");
            let handle = map.register(&obj);
            assert!(handle > PAYLOAD_MASK, "check word must be non-zero");
            assert!(map.has(handle));
            assert!(Arc::ptr_eq(&map.decode(handle), &obj));
            assert_eq!(map.count(), 1);
        }
    }

    #[test]
    fn forget_drops_at_zero() {
        let map = HandleMap::new(HandleMode::Indexed);
        let obj = Arc::new(7u32);
        let handle = map.register(&obj);
        let (forgotten, back) = map.forget(handle, 1);
        assert!(forgotten);
        assert!(Arc::ptr_eq(&back, &obj));
        assert_eq!(map.count(), 0);
        assert!(!map.has(handle));
    }

    #[test]
    fn slot_reuse_changes_check_word() {
        let map = HandleMap::new(HandleMode::Indexed);
        let first = Arc::new(1u32);
        let h1 = map.register(&first);
        map.forget(h1, 1);
        let second = Arc::new(2u32);
        let h2 = map.register(&second);
        // same slot, different check word
        assert_eq!(h1 & PAYLOAD_MASK, h2 & PAYLOAD_MASK);
        assert_ne!(h1, h2);
        assert!(!map.has(h1));
    }

    #[test]
    #[should_panic(expected = "double registration")]
    fn double_register_panics() {
        let map = HandleMap::new(HandleMode::Indexed);
        let obj = Arc::new(1u32);
        map.register(&obj);
        map.register(&obj);
    }

    #[test]
    #[should_panic(expected = "check word mismatch")]
    fn stale_decode_panics() {
        let map = HandleMap::new(HandleMode::Indexed);
        let first = Arc::new(1u32);
        let h1 = map.register(&first);
        map.forget(h1, 1);
        let second = Arc::new(2u32);
        map.register(&second);
        map.decode(h1);
    }

    #[test]
    #[should_panic(expected = "unknown handle")]
    fn unknown_decode_panics() {
        let map: HandleMap<u32> = HandleMap::new(HandleMode::Pointer);
        map.decode(0x7001_0000_0000_1000);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn unaligned_pointer_panics() {
        pointer_payload(0x1001);
    }

    #[test]
    #[should_panic(expected = "address bits")]
    fn wide_pointer_panics() {
        pointer_payload(1 << 50);
    }
}
