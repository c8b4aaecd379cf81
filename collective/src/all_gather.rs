use crate::{
    CollectiveError, CollectiveKernel, Communicator, Compute, KernelAttrs, OpKind, Tensor, convert,
    error::shape_mismatch, tensor::normalize_axis,
};
use std::{ops::DerefMut, sync::Arc};

/// Shape of the gathered tensor: dimension `axis` times `group_size`.
pub fn gathered_shape(
    shape: &[usize],
    group_size: usize,
    axis: i64,
) -> Result<Vec<usize>, CollectiveError> {
    let axis = normalize_axis(axis, shape.len())
        .ok_or_else(|| shape_mismatch(format!("axis {axis} is out of {shape:?}")))?;
    let mut ans = shape.to_vec();
    ans[axis] *= group_size;
    Ok(ans)
}

fn check_group(comm: &Communicator, group_size: usize) -> Result<(), CollectiveError> {
    if group_size == comm.world_size() {
        Ok(())
    } else {
        Err(CollectiveError::InvalidConfig(format!(
            "group_size {group_size} differs from world size {}",
            comm.world_size()
        )))
    }
}

/// Gathers every rank's `input` along `axis` into `output`, in rank order.
///
/// Ranks are trusted to contribute shards of the same shape.
pub fn all_gather_into(
    comm: &Communicator,
    input: &Tensor<&[u8]>,
    output: &mut Tensor<&mut [u8]>,
    group_size: usize,
    axis: i64,
) -> Result<(), CollectiveError> {
    convert(input.dt())?;
    check_group(comm, group_size)?;
    let shape = gathered_shape(input.shape(), group_size, axis)?;
    if output.dt() != input.dt() || output.shape() != shape {
        return Err(shape_mismatch(format!(
            "gathering {:?} along {axis} gives {shape:?}, output is {:?} of {:?}",
            input.shape(),
            output.shape(),
            output.dt()
        )));
    }
    let shard = input.nbytes();
    if shard == 0 {
        return Ok(());
    }

    let transport = comm.handle();
    let axis = normalize_axis(axis, input.ndim()).unwrap_or(0);
    let outer = input.shape()[..axis].iter().product::<usize>();
    if outer == 1 {
        transport.all_gather(output.data_mut(), Some(input.data()))?;
        return Ok(());
    }

    // gather rank-major, then move the group dimension in front of `axis`
    let mut buf = vec![0u8; shard * group_size];
    transport.all_gather(&mut buf, Some(input.data()))?;
    let row = shard / outer;
    let dst = output.data_mut();
    for (rank, chunk) in buf.chunks_exact(shard).enumerate() {
        for (i, src) in chunk.chunks_exact(row).enumerate() {
            dst[(i * group_size + rank) * row..][..row].copy_from_slice(src)
        }
    }
    Ok(())
}

/// Like [`all_gather_into`], allocating the output through `alloc`.
pub fn all_gather<T>(
    comm: &Communicator,
    input: &Tensor<&[u8]>,
    group_size: usize,
    axis: i64,
    alloc: impl FnOnce(usize) -> T,
) -> Result<Tensor<T>, CollectiveError>
where
    T: DerefMut<Target = [u8]>,
{
    let shape = gathered_shape(input.shape(), group_size, axis)?;
    let nbytes = shape.iter().product::<usize>() * input.dt().nbytes();
    let mut output = Tensor::new(input.dt(), shape, alloc(nbytes));
    all_gather_into(comm, input, &mut output.view_mut(), group_size, axis)?;
    Ok(output)
}

/// Concatenation of every rank's shard along one axis.
pub struct AllGather {
    base: CollectiveKernel,
    group_size: usize,
    axis: i64,
}

impl AllGather {
    pub fn new(comm: Arc<Communicator>, attrs: &KernelAttrs) -> Result<Self, CollectiveError> {
        Ok(Self {
            group_size: attrs.group_size(&comm)?,
            axis: attrs.axis,
            base: CollectiveKernel::new(comm),
        })
    }

    #[inline]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    #[inline]
    pub fn axis(&self) -> i64 {
        self.axis
    }
}

impl Compute for AllGather {
    const OP: OpKind = OpKind::AllGather;

    #[inline]
    fn kernel(&self) -> &CollectiveKernel {
        &self.base
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, CollectiveError> {
        gathered_shape(input, self.group_size, self.axis)
    }

    fn compute(
        &self,
        input: &Tensor<&[u8]>,
        output: &mut Tensor<&mut [u8]>,
    ) -> Result<(), CollectiveError> {
        all_gather_into(self.base.comm(), input, output, self.group_size, self.axis)
    }
}
