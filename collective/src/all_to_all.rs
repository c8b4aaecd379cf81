use crate::{
    CollectiveError, CollectiveKernel, Communicator, Compute, KernelAttrs, OpKind, Tensor, convert,
    error::shape_mismatch, tensor::normalize_axis,
};
use std::sync::Arc;

/// Splits `shape` at `axis` into `(outer, shard)`, where `shard` counts the
/// elements of one shard inside one outer slice.
fn shard_layout(
    shape: &[usize],
    group_size: usize,
    axis: i64,
) -> Result<(usize, usize), CollectiveError> {
    let idx = normalize_axis(axis, shape.len())
        .ok_or_else(|| shape_mismatch(format!("axis {axis} is out of {shape:?}")))?;
    let dim = shape[idx];
    if dim % group_size != 0 {
        return Err(shape_mismatch(format!(
            "dimension {idx} of {shape:?} is not divisible by group size {group_size}"
        )));
    }
    let outer = shape[..idx].iter().product::<usize>();
    let inner = shape[idx + 1..].iter().product::<usize>();
    Ok((outer, dim / group_size * inner))
}

/// Exchanges shards along `axis`: shard `s` of `output` on rank `r` receives
/// shard `r` of rank `s`'s `input`.
pub fn all_to_all(
    comm: &Communicator,
    input: &Tensor<&[u8]>,
    output: &mut Tensor<&mut [u8]>,
    group_size: usize,
    axis: i64,
) -> Result<(), CollectiveError> {
    convert(input.dt())?;
    if group_size != comm.world_size() {
        return Err(CollectiveError::InvalidConfig(format!(
            "group_size {group_size} differs from world size {}",
            comm.world_size()
        )));
    }
    if output.dt() != input.dt() || output.shape() != input.shape() {
        return Err(shape_mismatch(format!(
            "all-to-all of {:?} {:?} into {:?} {:?}",
            input.dt(),
            input.shape(),
            output.dt(),
            output.shape()
        )));
    }
    let (outer, shard) = shard_layout(input.shape(), group_size, axis)?;
    if input.nbytes() == 0 {
        return Ok(());
    }

    let transport = comm.handle();
    if outer == 1 {
        transport.all_to_all(output.data_mut(), input.data())?;
        return Ok(());
    }

    // [outer][group][shard] <-> [group][outer][shard]
    let chunk = shard * input.dt().nbytes();
    let block = outer * chunk;
    let src = input.data();
    let mut send = vec![0u8; src.len()];
    for (i, slice) in src.chunks_exact(group_size * chunk).enumerate() {
        for (s, part) in slice.chunks_exact(chunk).enumerate() {
            send[s * block + i * chunk..][..chunk].copy_from_slice(part)
        }
    }
    let mut recv = vec![0u8; src.len()];
    transport.all_to_all(&mut recv, &send)?;

    let dst = output.data_mut();
    for (s, peer) in recv.chunks_exact(block).enumerate() {
        for (i, part) in peer.chunks_exact(chunk).enumerate() {
            dst[(i * group_size + s) * chunk..][..chunk].copy_from_slice(part)
        }
    }
    Ok(())
}

/// Shard exchange across all ranks.
pub struct AllToAll {
    base: CollectiveKernel,
    group_size: usize,
    axis: i64,
}

impl AllToAll {
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

impl Compute for AllToAll {
    const OP: OpKind = OpKind::AllToAll;

    #[inline]
    fn kernel(&self) -> &CollectiveKernel {
        &self.base
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, CollectiveError> {
        shard_layout(input, self.group_size, self.axis)?;
        Ok(input.to_vec())
    }

    fn compute(
        &self,
        input: &Tensor<&[u8]>,
        output: &mut Tensor<&mut [u8]>,
    ) -> Result<(), CollectiveError> {
        all_to_all(self.base.comm(), input, output, self.group_size, self.axis)
    }
}
