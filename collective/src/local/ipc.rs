use crate::{DevMem, IpcHandle, IpcRuntime, PeerError};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Shareable allocations of one simulated node.
///
/// Every rank of a [`super::LocalGroup`] sees the same registry, the way the
/// processes of a host see the same device driver.
pub struct LocalIpc {
    limit: usize,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    generations: HashMap<usize, u64>,
    live: HashMap<u64, Entry>,
}

struct Entry {
    handle: IpcHandle,
    mem: DevMem,
}

impl Default for LocalIpc {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl LocalIpc {
    /// A runtime refusing single allocations above `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            registry: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles of every allocation still alive, oldest first.
    pub fn live_handles(&self) -> Vec<IpcHandle> {
        let mut ans = self
            .lock()
            .live
            .values()
            .map(|e| e.handle)
            .collect::<Vec<_>>();
        ans.sort_unstable_by_key(|h| h.id);
        ans
    }

    /// Withdraws a handle as if its owner had released and reallocated the
    /// memory behind it. Existing mappings keep the old memory but no
    /// longer validate.
    pub fn revoke(&self, handle: &IpcHandle) -> bool {
        let mut registry = self.lock();
        match registry.live.get(&handle.id) {
            Some(e) if e.handle == *handle => {
                registry.live.remove(&handle.id);
                true
            }
            _ => false,
        }
    }
}

impl IpcRuntime for LocalIpc {
    fn alloc_shared(&self, owner: usize, size: usize) -> Result<(DevMem, IpcHandle), PeerError> {
        if size > self.limit {
            return Err(PeerError::OutOfMemory(size));
        }
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        let generation = registry.generations.entry(owner).or_default();
        *generation += 1;
        let handle = IpcHandle {
            id,
            generation: *generation,
            owner,
            size,
        };
        let mem = DevMem::new(size);
        registry.live.insert(
            id,
            Entry {
                handle,
                mem: mem.clone(),
            },
        );
        Ok((mem, handle))
    }

    fn open(&self, handle: &IpcHandle) -> Result<DevMem, PeerError> {
        match self.lock().live.get(&handle.id) {
            Some(e) if e.handle == *handle => Ok(e.mem.clone()),
            _ => Err(PeerError::Revoked {
                owner: handle.owner,
                id: handle.id,
                generation: handle.generation,
            }),
        }
    }

    fn is_alive(&self, handle: &IpcHandle) -> bool {
        self.lock()
            .live
            .get(&handle.id)
            .is_some_and(|e| e.handle == *handle)
    }

    fn free(&self, handle: &IpcHandle) {
        self.revoke(handle);
    }
}

#[test]
fn test_registry() {
    let ipc = LocalIpc::default();
    let (mem, a) = ipc.alloc_shared(0, 16).unwrap();
    let (_, b) = ipc.alloc_shared(0, 16).unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(b.generation, a.generation + 1);
    assert_eq!(ipc.live_handles(), [a, b]);

    let mapped = ipc.open(&a).unwrap();
    assert!(mapped.same_allocation(&mem));

    assert!(ipc.revoke(&a));
    assert!(!ipc.revoke(&a));
    assert!(!ipc.is_alive(&a));
    assert!(ipc.is_alive(&b));
    assert!(matches!(ipc.open(&a), Err(PeerError::Revoked { .. })));

    ipc.free(&b);
    assert!(ipc.live_handles().is_empty());
    assert!(matches!(
        LocalIpc::with_limit(8).alloc_shared(1, 9),
        Err(PeerError::OutOfMemory(9))
    ));
}
