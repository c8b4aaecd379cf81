//! Collective communication kernels for multi-rank tensor execution.
//!
//! Every rank owns one [`Communicator`]; kernels built from it run
//! AllReduce, AllGather and AllToAll over dense tensors. AllReduce between
//! ranks of one node may bypass the transport and reduce through peer
//! mapped staging memory, see [`SelectionPolicy`].

mod all_gather;
mod all_reduce;
mod all_to_all;
mod communicator;
mod data_type;
mod error;
mod ipc;
mod kernel;
mod policy;
mod tensor;
mod transport;

pub mod local;

pub use all_gather::{AllGather, all_gather, all_gather_into, gathered_shape};
pub use all_reduce::{AllReduce, all_reduce, custom_all_reduce};
pub use all_to_all::{AllToAll, all_to_all};
pub use communicator::{Communicator, LaunchEnv};
pub use data_type::{WireType, accumulate, convert};
pub use error::{CollectiveError, KernelError, OpKind};
pub use ipc::{DevMem, IpcHandle, IpcMemory, IpcMemoryPack, IpcRuntime, PeerError};
pub use kernel::{Collective, CollectiveKernel, Compute, KernelAttrs};
pub use policy::{ReducePath, SelectionPolicy, Tier, Topology};
pub use tensor::{Tensor, normalize_axis};
pub use transport::{Transport, TransportError, check};
