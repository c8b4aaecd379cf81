use crate::{
    AllGather, AllReduce, AllToAll, CollectiveError, Communicator, KernelError, OpKind, Tensor,
};
use std::sync::Arc;

/// Binding of a kernel instance to the process communicator.
#[derive(Clone)]
pub struct CollectiveKernel {
    comm: Arc<Communicator>,
}

impl CollectiveKernel {
    #[inline]
    pub fn new(comm: Arc<Communicator>) -> Self {
        Self { comm }
    }

    #[inline]
    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }
}

/// Node attributes a collective kernel is built from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct KernelAttrs {
    /// Ranks taking part; `-1` means the whole world.
    pub group_size: i64,
    /// Shard axis; negative values count from the last dimension.
    pub axis: i64,
}

impl Default for KernelAttrs {
    fn default() -> Self {
        Self {
            group_size: -1,
            axis: 0,
        }
    }
}

impl KernelAttrs {
    /// Resolves `group_size` against the communicator.
    ///
    /// Sub-groups are not supported: the group is always the whole world.
    pub fn group_size(&self, comm: &Communicator) -> Result<usize, CollectiveError> {
        match self.group_size {
            -1 => Ok(comm.world_size()),
            n if n == comm.world_size() as i64 => Ok(comm.world_size()),
            n => Err(CollectiveError::InvalidConfig(format!(
                "group_size {n} differs from world size {}",
                comm.world_size()
            ))),
        }
    }
}

/// What every collective kernel offers to the execution engine.
pub trait Compute {
    const OP: OpKind;

    fn kernel(&self) -> &CollectiveKernel;

    /// Shape the engine must allocate for the output.
    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, CollectiveError>;

    /// Runs the collective. Outputs are undefined when this fails.
    fn compute(
        &self,
        input: &Tensor<&[u8]>,
        output: &mut Tensor<&mut [u8]>,
    ) -> Result<(), CollectiveError>;
}

/// The closed set of collective kernels.
pub enum Collective {
    AllReduce(AllReduce),
    AllGather(AllGather),
    AllToAll(AllToAll),
}

macro_rules! dispatch {
    ($self:expr, $k:ident => $body:expr) => {
        match $self {
            Collective::AllReduce($k) => $body,
            Collective::AllGather($k) => $body,
            Collective::AllToAll($k) => $body,
        }
    };
}

impl Collective {
    /// Builds the kernel registered under `op_type`.
    pub fn new(
        op_type: &str,
        attrs: &KernelAttrs,
        comm: Arc<Communicator>,
    ) -> Result<Self, CollectiveError> {
        Ok(match op_type {
            "AllReduce" => Self::AllReduce(AllReduce::new(comm)),
            "AllGather" => Self::AllGather(AllGather::new(comm, attrs)?),
            "AllToAll" => Self::AllToAll(AllToAll::new(comm, attrs)?),
            _ => {
                return Err(CollectiveError::InvalidConfig(format!(
                    "unknown collective {op_type}"
                )));
            }
        })
    }

    #[inline]
    pub fn op(&self) -> OpKind {
        match self {
            Self::AllReduce(_) => AllReduce::OP,
            Self::AllGather(_) => AllGather::OP,
            Self::AllToAll(_) => AllToAll::OP,
        }
    }

    #[inline]
    pub fn kernel(&self) -> &CollectiveKernel {
        dispatch!(self, k => k.kernel())
    }

    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, KernelError> {
        dispatch!(self, k => k.output_shape(input)).map_err(|e| self.error(e))
    }

    pub fn compute(
        &self,
        input: &Tensor<&[u8]>,
        output: &mut Tensor<&mut [u8]>,
    ) -> Result<(), KernelError> {
        dispatch!(self, k => k.compute(input, output)).map_err(|e| {
            let e = self.error(e);
            log::error!("{e}");
            e
        })
    }

    fn error(&self, source: CollectiveError) -> KernelError {
        KernelError {
            rank: self.kernel().rank(),
            op: self.op(),
            source,
        }
    }
}
