//! Ranks hosted as threads of one process.
//!
//! Each rank gets its own [`Communicator`] and must be driven from its own
//! thread, exactly like ranks living in separate processes. All ranks share
//! one simulated node, so the peer memory path is available when the group
//! is built with [`LocalGroup::with_ipc`].

mod ipc;
mod rendezvous;

pub use ipc::LocalIpc;

use crate::{
    CollectiveError, Communicator, IpcRuntime, LaunchEnv, Transport, TransportError, WireType,
    accumulate,
};
use rendezvous::Rendezvous;
use std::{
    mem::take,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering::Relaxed},
    },
};

struct Node {
    size: usize,
    rendezvous: Rendezvous,
    board: Mutex<Vec<Vec<u8>>>,
    calls: AtomicUsize,
}

impl Node {
    /// Publishes `local` and returns what every rank published.
    fn exchange(&self, rank: usize, local: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)[rank] = local.to_vec();
        self.rendezvous.wait()?;
        let ans = self
            .board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.rendezvous.wait()?;
        Ok(ans)
    }
}

/// Builder of an in-process collective group.
pub struct LocalGroup {
    node: Arc<Node>,
    local_size: usize,
    ipc: Option<Arc<LocalIpc>>,
}

impl LocalGroup {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            node: Arc::new(Node {
                size,
                rendezvous: Rendezvous::new(size),
                board: Mutex::new(vec![Vec::new(); size]),
                calls: AtomicUsize::new(0),
            }),
            local_size: size,
            ipc: None,
        }
    }

    /// A group whose ranks can map each other's memory.
    pub fn with_ipc(size: usize) -> Self {
        Self::new(size).ipc(LocalIpc::default())
    }

    pub fn ipc(mut self, ipc: LocalIpc) -> Self {
        self.ipc = Some(Arc::new(ipc));
        self
    }

    /// Pretends the ranks are spread over nodes of `local_size` ranks each.
    pub fn local_size(mut self, local_size: usize) -> Self {
        assert!(local_size > 0 && self.node.size % local_size == 0);
        self.local_size = local_size;
        self
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.node.size
    }

    /// Counter of transport invocations made by all ranks.
    #[inline]
    pub fn calls(&self) -> CallCounter {
        CallCounter(self.node.clone())
    }

    #[inline]
    pub fn ipc_runtime(&self) -> Option<Arc<LocalIpc>> {
        self.ipc.clone()
    }

    pub fn into_transports(self) -> Vec<LocalTransport> {
        (0..self.node.size)
            .map(|rank| LocalTransport {
                rank,
                node: self.node.clone(),
            })
            .collect()
    }

    pub fn into_communicators(self) -> Result<Vec<Communicator>, CollectiveError> {
        let world_size = self.node.size;
        let local_size = self.local_size;
        let ipc = self.ipc.clone().map(|ipc| ipc as Arc<dyn IpcRuntime>);
        self.into_transports()
            .into_iter()
            .map(|transport| {
                let rank = transport.rank;
                let env = LaunchEnv {
                    rank,
                    world_size,
                    local_rank: rank % local_size,
                    local_size,
                };
                Communicator::init(env, Box::new(transport), ipc.clone())
            })
            .collect()
    }
}

/// Reads the number of transport calls of a [`LocalGroup`].
#[derive(Clone)]
pub struct CallCounter(Arc<Node>);

impl CallCounter {
    #[inline]
    pub fn get(&self) -> usize {
        self.0.calls.load(Relaxed)
    }
}

/// One rank's endpoint of a [`LocalGroup`].
pub struct LocalTransport {
    rank: usize,
    node: Arc<Node>,
}

impl LocalTransport {
    #[inline]
    fn count_call(&self) {
        self.node.calls.fetch_add(1, Relaxed);
    }

    /// Makes every pending and future collective of the group fail.
    pub fn abort(&self) {
        self.node.rendezvous.abort()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.abort()
    }
}

impl Transport for LocalTransport {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn count(&self) -> usize {
        self.node.size
    }

    fn all_reduce_sum(
        &self,
        dst: &mut [u8],
        src: Option<&[u8]>,
        ty: WireType,
    ) -> Result<(), TransportError> {
        self.count_call();
        if let Some(src) = src {
            if src.len() != dst.len() {
                return Err(TransportError::InvalidArgument);
            }
        }
        if dst.len() % ty.size() != 0 {
            return Err(TransportError::InvalidArgument);
        }
        let mut records = self.node.exchange(self.rank, src.unwrap_or(&*dst))?;
        if records.iter().any(|r| r.len() != dst.len()) {
            return Err(TransportError::InvalidUsage);
        }
        let mut sum = take(&mut records[0]);
        for record in &records[1..] {
            accumulate(&mut sum, record, ty)
        }
        dst.copy_from_slice(&sum);
        Ok(())
    }

    fn all_gather(&self, dst: &mut [u8], src: Option<&[u8]>) -> Result<(), TransportError> {
        self.count_call();
        let count = self.node.size;
        if dst.len() % count != 0 {
            return Err(TransportError::InvalidArgument);
        }
        let chunk = dst.len() / count;
        let local = match src {
            Some(src) if src.len() == chunk => src.to_vec(),
            Some(_) => return Err(TransportError::InvalidArgument),
            None => dst[self.rank * chunk..][..chunk].to_vec(),
        };
        let records = self.node.exchange(self.rank, &local)?;
        if records.iter().any(|r| r.len() != chunk) {
            return Err(TransportError::InvalidUsage);
        }
        for (dst, record) in dst.chunks_exact_mut(chunk.max(1)).zip(&records) {
            dst.copy_from_slice(record)
        }
        Ok(())
    }

    fn all_to_all(&self, dst: &mut [u8], src: &[u8]) -> Result<(), TransportError> {
        self.count_call();
        let count = self.node.size;
        if dst.len() != src.len() || src.len() % count != 0 {
            return Err(TransportError::InvalidArgument);
        }
        let chunk = src.len() / count;
        let records = self.node.exchange(self.rank, src)?;
        if records.iter().any(|r| r.len() != src.len()) {
            return Err(TransportError::InvalidUsage);
        }
        for (dst, record) in dst.chunks_exact_mut(chunk.max(1)).zip(&records) {
            dst.copy_from_slice(&record[self.rank * chunk..][..chunk])
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.count_call();
        self.node.rendezvous.wait()
    }

    fn exchange(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        self.count_call();
        self.node.exchange(self.rank, local)
    }
}
