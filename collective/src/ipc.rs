//! Peer memory shared between the ranks of one node.
//!
//! A rank allocates a staging buffer through the node's [`IpcRuntime`],
//! publishes its [`IpcHandle`] to every peer over the communicator's
//! out-of-band channel and opens the handles it receives. Handles carry a
//! generation so that a mapping whose allocation went away is detected
//! instead of being read through.

use crate::{Communicator, TransportError, WireType, accumulate};
use log::{debug, warn};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no peer memory runtime is attached to the communicator")]
    Unavailable,
    #[error("failed to allocate {0} bytes of shareable memory")]
    OutOfMemory(usize),
    #[error("handle {id} (generation {generation}) of rank {owner} is no longer valid")]
    Revoked {
        owner: usize,
        id: u64,
        generation: u64,
    },
    #[error("malformed handle record received from rank {0}")]
    Malformed(usize),
    #[error("rank {rank} published a handle owned by rank {owner}")]
    OwnerMismatch { rank: usize, owner: usize },
    #[error("rank {rank} stages {size} bytes, expected {expected}")]
    SizeMismatch {
        rank: usize,
        size: usize,
        expected: usize,
    },
    #[error("handle exchange failed: {0}")]
    Exchange(#[from] TransportError),
}

/// Device allocation that may be mapped into several ranks.
#[derive(Clone, Debug)]
pub struct DevMem(Arc<RwLock<Box<[u8]>>>);

impl DevMem {
    pub fn new(size: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0; size].into_boxed_slice())))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        let mut mem = self.0.write().unwrap_or_else(PoisonError::into_inner);
        mem[offset..][..src.len()].copy_from_slice(src)
    }

    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let mem = self.0.read().unwrap_or_else(PoisonError::into_inner);
        dst.copy_from_slice(&mem[offset..][..dst.len()])
    }

    /// `dst += self[offset..offset + dst.len()]`.
    pub fn accumulate_to(&self, offset: usize, dst: &mut [u8], ty: WireType) {
        let mem = self.0.read().unwrap_or_else(PoisonError::into_inner);
        accumulate(dst, &mem[offset..][..dst.len()], ty)
    }

    #[inline]
    pub fn same_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Shareable handle to a device allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IpcHandle {
    pub id: u64,
    pub generation: u64,
    pub owner: usize,
    pub size: usize,
}

impl IpcHandle {
    pub const ENCODED_LEN: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut ans = [0; Self::ENCODED_LEN];
        ans[0..8].copy_from_slice(&self.id.to_le_bytes());
        ans[8..16].copy_from_slice(&self.generation.to_le_bytes());
        ans[16..24].copy_from_slice(&(self.owner as u64).to_le_bytes());
        ans[24..32].copy_from_slice(&(self.size as u64).to_le_bytes());
        ans
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..][..8].try_into().unwrap());
        Some(Self {
            id: word(0),
            generation: word(1),
            owner: word(2).try_into().ok()?,
            size: word(3).try_into().ok()?,
        })
    }
}

/// Node-local runtime able to share device allocations between processes.
pub trait IpcRuntime: Send + Sync {
    /// Allocates `size` bytes on behalf of `owner` and exports a handle.
    fn alloc_shared(&self, owner: usize, size: usize) -> Result<(DevMem, IpcHandle), PeerError>;

    /// Maps a peer's allocation into this process.
    fn open(&self, handle: &IpcHandle) -> Result<DevMem, PeerError>;

    fn is_alive(&self, handle: &IpcHandle) -> bool;

    /// Releases an allocation made by [`IpcRuntime::alloc_shared`].
    fn free(&self, handle: &IpcHandle);
}

/// One staging buffer per rank, all mapped locally.
pub struct IpcMemory {
    runtime: Arc<dyn IpcRuntime>,
    rank: usize,
    size: usize,
    local: IpcHandle,
    mems: Vec<(IpcHandle, DevMem)>,
}

impl IpcMemory {
    /// Collective: allocates the local buffer and maps every peer's buffer.
    pub fn establish(comm: &Communicator, size: usize) -> Result<Self, PeerError> {
        let runtime = comm.ipc().ok_or(PeerError::Unavailable)?.clone();
        let rank = comm.rank();
        let (mem, local) = runtime.alloc_shared(rank, size)?;
        let mut ans = Self {
            runtime,
            rank,
            size,
            local,
            mems: Vec::with_capacity(comm.world_size()),
        };

        let records = comm.handle().exchange(&local.to_bytes())?;
        let opened = ans.open_peers(&records, &mem);
        // no rank may release its allocation before every peer has mapped it
        comm.handle().barrier()?;
        opened?;
        debug!(
            "rank {rank} mapped {} peer buffers of {size} bytes",
            ans.mems.len() - 1
        );
        Ok(ans)
    }

    fn open_peers(&mut self, records: &[Vec<u8>], mem: &DevMem) -> Result<(), PeerError> {
        let mut handles = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let handle = IpcHandle::from_bytes(record).ok_or(PeerError::Malformed(i))?;
            if handle.owner != i {
                return Err(PeerError::OwnerMismatch {
                    rank: i,
                    owner: handle.owner,
                });
            }
            if handle.size != self.size {
                return Err(PeerError::SizeMismatch {
                    rank: i,
                    size: handle.size,
                    expected: self.size,
                });
            }
            handles.push(handle)
        }
        for handle in handles {
            let peer = if handle.owner == self.rank {
                mem.clone()
            } else {
                self.runtime.open(&handle)?
            };
            self.mems.push((handle, peer))
        }
        Ok(())
    }

    /// Checks every mapped allocation, including the local one, is unchanged.
    pub fn validate(&self) -> Result<(), PeerError> {
        for (handle, _) in &self.mems {
            if !self.runtime.is_alive(handle) {
                return Err(PeerError::Revoked {
                    owner: handle.owner,
                    id: handle.id,
                    generation: handle.generation,
                });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn local(&self) -> &DevMem {
        &self.mems[self.rank].1
    }

    #[inline]
    pub fn peer(&self, rank: usize) -> &DevMem {
        &self.mems[rank].1
    }
}

impl Drop for IpcMemory {
    fn drop(&mut self) {
        self.runtime.free(&self.local)
    }
}

/// Staging memory cached across calls of one kernel.
#[derive(Default)]
pub struct IpcMemoryPack(Option<IpcMemory>);

impl IpcMemoryPack {
    /// Collective: returns staging memory of at least `capacity` bytes whose
    /// mappings are all valid, re-establishing it when needed.
    ///
    /// Every rank must reach the same verdict, so callers synchronize the
    /// group before acquiring.
    pub fn acquire(
        &mut self,
        comm: &Communicator,
        capacity: usize,
    ) -> Result<&IpcMemory, PeerError> {
        let mem = match self.0.take() {
            Some(mem) if mem.size() >= capacity && Self::check(&mem) => mem,
            stale => {
                drop(stale);
                IpcMemory::establish(comm, capacity)?
            }
        };
        Ok(self.0.insert(mem))
    }

    fn check(mem: &IpcMemory) -> bool {
        match mem.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("rank {} re-establishes peer memory: {e}", mem.rank);
                false
            }
        }
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.0.is_some()
    }

    #[inline]
    pub fn invalidate(&mut self) {
        self.0 = None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::local::LocalGroup;
    use test_utils::run_ranks;

    #[test]
    fn test_handle_record() {
        let handle = IpcHandle {
            id: 7,
            generation: 3,
            owner: 1,
            size: 4096,
        };
        assert_eq!(IpcHandle::from_bytes(&handle.to_bytes()), Some(handle));
        assert_eq!(IpcHandle::from_bytes(&[0; 31]), None);
    }

    #[test]
    fn test_establish() {
        let comms = LocalGroup::with_ipc(3).into_communicators().unwrap();
        run_ranks(comms, |comm| {
            let mem = IpcMemory::establish(&comm, 64).unwrap();
            mem.local().copy_in(0, &[comm.rank() as u8 + 1; 64]);
            comm.handle().barrier().unwrap();
            for peer in 0..comm.world_size() {
                let mut buf = [0; 64];
                mem.peer(peer).copy_out(0, &mut buf);
                assert_eq!(buf, [peer as u8 + 1; 64]);
            }
            comm.handle().barrier().unwrap();
        });
    }

    #[test]
    fn test_unavailable() {
        let comms = LocalGroup::new(1).into_communicators().unwrap();
        assert!(matches!(
            IpcMemory::establish(&comms[0], 16),
            Err(PeerError::Unavailable)
        ));
    }

    #[test]
    fn test_pack_reuse_and_grow() {
        let comms = LocalGroup::with_ipc(2).into_communicators().unwrap();
        run_ranks(comms, |comm| {
            let mut pack = IpcMemoryPack::default();
            assert!(!pack.is_established());
            let barrier = || comm.handle().barrier().unwrap();

            barrier();
            let first = pack.acquire(&comm, 32).unwrap().local().clone();
            barrier();
            let again = pack.acquire(&comm, 16).unwrap().local().clone();
            assert!(first.same_allocation(&again));
            barrier();
            let grown = pack.acquire(&comm, 128).unwrap().local().clone();
            assert_eq!(grown.len(), 128);
            assert!(!grown.same_allocation(&first));
            barrier();
            pack.invalidate();
            assert!(!pack.is_established());
            let fresh = pack.acquire(&comm, 16).unwrap();
            assert_eq!(fresh.size(), 16);
            assert!(!fresh.local().same_allocation(&grown));
        });
    }

    #[test]
    fn test_size_mismatch() {
        let group = LocalGroup::with_ipc(2);
        let ipc = group.ipc_runtime().unwrap();
        let comms = group.into_communicators().unwrap();
        run_ranks(comms, |comm| {
            let size = 32 * (comm.rank() + 1);
            let e = IpcMemory::establish(&comm, size).err().unwrap();
            let peer = 1 - comm.rank();
            assert!(matches!(
                e,
                PeerError::SizeMismatch { rank, size: theirs, expected }
                    if rank == peer && theirs == 32 * (peer + 1) && expected == size
            ));
        });
        assert!(ipc.live_handles().is_empty());
    }
}
