use crate::{
    CollectiveError, CollectiveKernel, Communicator, Compute, IpcMemoryPack, OpKind, PeerError,
    ReducePath, SelectionPolicy, Tensor, WireType, convert, error::shape_mismatch,
};
use log::trace;
use std::sync::{Arc, Mutex, PoisonError};

/// Standard-path sum through the transport.
pub fn all_reduce(
    comm: &Communicator,
    input: &Tensor<&[u8]>,
    output: &mut Tensor<&mut [u8]>,
) -> Result<(), CollectiveError> {
    let ty = check(input, output)?;
    if comm.world_size() == 1 {
        output.data_mut().copy_from_slice(input.data());
        return Ok(());
    }
    comm.handle()
        .all_reduce_sum(output.data_mut(), Some(input.data()), ty)?;
    Ok(())
}

/// Peer memory sum of `src` into `dst` on a single node.
///
/// `pack` caches the staging memory between calls; it is acquired after the
/// ranks agreed on the message length, so all of them see the same mapping
/// state. Failures of the synchronization itself surface as
/// [`PeerError::Exchange`].
pub fn custom_all_reduce(
    comm: &Communicator,
    src: &[u8],
    dst: &mut [u8],
    ty: WireType,
    path: ReducePath,
    pack: &mut IpcMemoryPack,
) -> Result<(), CollectiveError> {
    let n = comm.world_size();
    let rank = comm.rank();
    let len = src.len();
    if dst.len() != len || len % ty.size() != 0 {
        return Err(shape_mismatch(format!(
            "cannot reduce {len} bytes into {} bytes of {}",
            dst.len(),
            ty.name()
        )));
    }
    match path {
        ReducePath::OneShot => {}
        ReducePath::TwoShot if len % (n * ty.size()) == 0 => {}
        _ => {
            return Err(CollectiveError::InvalidConfig(format!(
                "{path:?} over {len} bytes is not a peer memory reduction"
            )));
        }
    }

    let transport = comm.handle();
    let sync = || transport.barrier().map_err(PeerError::Exchange);
    // entry barrier, also proving every rank stages the same length
    let lens = transport
        .exchange(&(len as u64).to_le_bytes())
        .map_err(PeerError::Exchange)?;
    if let Some((peer, theirs)) = lens
        .iter()
        .map(|r| r.as_slice().try_into().map_or(u64::MAX, u64::from_le_bytes))
        .enumerate()
        .find(|&(_, theirs)| theirs != len as u64)
    {
        return Err(PeerError::SizeMismatch {
            rank: peer,
            size: theirs as _,
            expected: len,
        }
        .into());
    }
    // staging layout: [ inputs | reduced slices ]
    let mem = pack.acquire(comm, 2 * len)?;
    mem.local().copy_in(0, src);
    sync()?;

    if path == ReducePath::OneShot {
        mem.peer(0).copy_out(0, dst);
        for peer in 1..n {
            mem.peer(peer).accumulate_to(0, dst, ty)
        }
    } else {
        let slice = len / n;
        let offset = rank * slice;
        let part = &mut dst[offset..][..slice];
        mem.peer(0).copy_out(offset, part);
        for peer in 1..n {
            mem.peer(peer).accumulate_to(offset, part, ty)
        }
        mem.local().copy_in(len + offset, part);
        sync()?;
        for peer in (0..n).filter(|&p| p != rank) {
            mem.peer(peer)
                .copy_out(len + peer * slice, &mut dst[peer * slice..][..slice])
        }
    }

    sync()?;
    Ok(())
}

fn check(
    input: &Tensor<&[u8]>,
    output: &Tensor<&mut [u8]>,
) -> Result<WireType, CollectiveError> {
    let ty = convert(input.dt())?;
    if output.dt() != input.dt() || output.shape() != input.shape() {
        return Err(shape_mismatch(format!(
            "output {:?} of {:?} does not match input {:?} of {:?}",
            output.shape(),
            output.dt(),
            input.shape(),
            input.dt()
        )));
    }
    Ok(ty)
}

/// Element-wise sum over all ranks.
pub struct AllReduce {
    base: CollectiveKernel,
    policy: SelectionPolicy,
    pack: Mutex<IpcMemoryPack>,
}

impl AllReduce {
    /// Kernel using the policy configured by the process environment.
    pub fn new(comm: Arc<Communicator>) -> Self {
        Self::with_policy(comm, SelectionPolicy::from_env())
    }

    pub fn with_policy(comm: Arc<Communicator>, policy: SelectionPolicy) -> Self {
        Self {
            base: CollectiveKernel::new(comm),
            policy,
            pack: Default::default(),
        }
    }

    #[inline]
    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Path a reduction of `count` elements of `ty` takes on this kernel.
    #[inline]
    pub fn path(&self, count: usize, ty: WireType) -> ReducePath {
        self.policy.select(count, ty, &self.base.comm().topology())
    }
}

impl Compute for AllReduce {
    const OP: OpKind = OpKind::AllReduce;

    #[inline]
    fn kernel(&self) -> &CollectiveKernel {
        &self.base
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, CollectiveError> {
        Ok(input.to_vec())
    }

    fn compute(
        &self,
        input: &Tensor<&[u8]>,
        output: &mut Tensor<&mut [u8]>,
    ) -> Result<(), CollectiveError> {
        let ty = check(input, output)?;
        let comm = self.base.comm();
        let path = self.path(input.count(), ty);
        trace!("rank {} all-reduce via {path:?}", comm.rank());
        match path {
            ReducePath::PassThrough => {
                output.data_mut().copy_from_slice(input.data());
                Ok(())
            }
            ReducePath::Standard => all_reduce(comm, input, output),
            ReducePath::OneShot | ReducePath::TwoShot => {
                let mut pack = self.pack.lock().unwrap_or_else(PoisonError::into_inner);
                custom_all_reduce(comm, input.data(), output.data_mut(), ty, path, &mut pack)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        IpcRuntime, Tier, TransportError,
        local::{LocalGroup, LocalIpc},
    };
    use digit_layout::{DigitLayout, types};
    use half::f16;
    use test_utils::{diff, random_f32, run_ranks};

    fn rand_f32(rank: usize, len: usize) -> Vec<f32> {
        random_f32(rank as _, len)
    }

    fn to_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    /// Sum in ascending rank order, the order every path folds in.
    fn reference(n: usize, len: usize) -> Vec<f32> {
        let mut ans = rand_f32(0, len);
        for rank in 1..n {
            for (a, b) in ans.iter_mut().zip(rand_f32(rank, len)) {
                *a += b
            }
        }
        ans
    }

    fn run(group: LocalGroup, policy: SelectionPolicy, len: usize) -> Vec<(ReducePath, Vec<u8>)> {
        let comms = group.into_communicators().unwrap();
        run_ranks(comms, |comm| {
            let rank = comm.rank();
            let kernel = AllReduce::with_policy(Arc::new(comm), policy.clone());
            let input = to_bytes(&rand_f32(rank, len));
            let mut output = vec![0u8; input.len()];
            kernel
                .compute(
                    &Tensor::new(types::F32, [len], &*input),
                    &mut Tensor::new(types::F32, [len], &mut *output),
                )
                .unwrap();
            (kernel.path(len, WireType::Float32), output)
        })
    }

    fn assert_sum(results: &[(ReducePath, Vec<u8>)], path: ReducePath, n: usize, len: usize) {
        let ans = to_bytes(&reference(n, len));
        for (p, output) in results {
            assert_eq!(*p, path);
            assert_eq!(*output, ans);
        }
    }

    #[test]
    fn test_standard() {
        for n in [2, 3, 4] {
            let results = run(LocalGroup::new(n), SelectionPolicy::default(), 100);
            assert_sum(&results, ReducePath::Standard, n, 100);
        }
    }

    #[test]
    fn test_one_shot() {
        for n in [2, 4, 8] {
            let results = run(LocalGroup::with_ipc(n), SelectionPolicy::default(), 257);
            assert_sum(&results, ReducePath::OneShot, n, 257);
        }
    }

    #[test]
    fn test_two_shot() {
        let policy = SelectionPolicy {
            tiers: vec![Tier {
                max_world: 8,
                one_shot_below: 0,
                two_shot_below: usize::MAX,
            }],
            ..SelectionPolicy::default()
        };
        let results = run(LocalGroup::with_ipc(4), policy, 1024);
        assert_sum(&results, ReducePath::TwoShot, 4, 1024);
    }

    #[test]
    fn test_paths_agree() {
        let standard = run(LocalGroup::with_ipc(4), SelectionPolicy::disabled(), 64);
        let custom = run(LocalGroup::with_ipc(4), SelectionPolicy::default(), 64);
        assert_eq!(standard[0].0, ReducePath::Standard);
        assert_eq!(custom[0].0, ReducePath::OneShot);
        assert_eq!(standard[0].1, custom[3].1);

        let (max, rel) = diff(&from_bytes(&custom[0].1), &reference(4, 64));
        assert_eq!((max, rel), (0., 0.));
    }

    #[test]
    fn test_single_rank() {
        let group = LocalGroup::with_ipc(1);
        let calls = group.calls();
        let comm = Arc::new(group.into_communicators().unwrap().remove(0));
        let kernel = AllReduce::new(comm);
        let input = to_bytes(&[1., 2., 3.]);
        let mut output = vec![0u8; input.len()];
        kernel
            .compute(
                &Tensor::new(types::F32, [3], &*input),
                &mut Tensor::new(types::F32, [3], &mut *output),
            )
            .unwrap();
        assert_eq!(output, input);
        assert_eq!(calls.get(), 0);
    }

    fn reduce_typed(dt: DigitLayout, inputs: Vec<Vec<u8>>, ipc: bool) -> Vec<Vec<u8>> {
        let n = inputs.len();
        let group = if ipc {
            LocalGroup::with_ipc(n)
        } else {
            LocalGroup::new(n)
        };
        let comms = group.into_communicators().unwrap();
        let items = comms.into_iter().zip(inputs).collect::<Vec<_>>();
        run_ranks(items, |(comm, input)| {
            let kernel = AllReduce::with_policy(Arc::new(comm), SelectionPolicy::default());
            let len = input.len() / dt.nbytes();
            let mut output = vec![0u8; input.len()];
            kernel
                .compute(
                    &Tensor::new(dt, [len], &*input),
                    &mut Tensor::new(dt, [len], &mut *output),
                )
                .unwrap();
            output
        })
    }

    #[test]
    fn test_types() {
        let ints = (0..4)
            .map(|r: i64| {
                [r, -7 * r, i64::MAX]
                    .iter()
                    .flat_map(|x| x.to_le_bytes())
                    .collect()
            })
            .collect::<Vec<Vec<u8>>>();
        for ipc in [false, true] {
            let ans = reduce_typed(types::I64, ints.clone(), ipc);
            let expect = [6i64, -42, i64::MAX.wrapping_mul(4)]
                .iter()
                .flat_map(|x| x.to_le_bytes())
                .collect::<Vec<_>>();
            assert!(ans.iter().all(|x| *x == expect));
        }

        let halves = (0..2)
            .map(|r| {
                [0.5f32 * r as f32, 1.25, -2.]
                    .iter()
                    .flat_map(|x| f16::from_f32(*x).to_le_bytes())
                    .collect()
            })
            .collect::<Vec<Vec<u8>>>();
        let ans = reduce_typed(types::F16, halves, true);
        let expect = [0.5f32, 2.5, -4.]
            .iter()
            .flat_map(|x| f16::from_f32(*x).to_le_bytes())
            .collect::<Vec<_>>();
        assert!(ans.iter().all(|x| *x == expect));

        let bytes = vec![vec![200u8, 1], vec![100, 2]];
        let ans = reduce_typed(types::U8, bytes, true);
        assert!(ans.iter().all(|x| *x == [44, 3]));
    }

    #[test]
    fn test_unsupported_type() {
        let group = LocalGroup::with_ipc(2);
        let calls = group.calls();
        let comms = group.into_communicators().unwrap();
        run_ranks(comms, |comm| {
            let kernel = AllReduce::new(Arc::new(comm));
            let input = vec![1u8; 8];
            let mut output = vec![0xa5u8; 8];
            let e = kernel
                .compute(
                    &Tensor::new(types::BF16, [4], &*input),
                    &mut Tensor::new(types::BF16, [4], &mut *output),
                )
                .unwrap_err();
            assert!(matches!(e, CollectiveError::UnsupportedType(types::BF16)));
            assert_eq!(output, [0xa5; 8]);
        });
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_shape_mismatch() {
        let comms = LocalGroup::new(2).into_communicators().unwrap();
        let kernel = AllReduce::new(Arc::new(comms.into_iter().next().unwrap()));
        let input = vec![0u8; 16];
        let mut output = vec![0u8; 16];
        assert!(matches!(
            kernel.compute(
                &Tensor::new(types::F32, [4], &*input),
                &mut Tensor::new(types::F32, [2, 2], &mut *output),
            ),
            Err(CollectiveError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_stale_mapping() {
        const SENTINEL: u8 = 0x7f;
        let group = LocalGroup::with_ipc(2);
        let ipc = group.ipc_runtime().unwrap();
        let comms = group.into_communicators().unwrap();
        let len = 16;
        let round = |comm: &Arc<Communicator>, kernel: &AllReduce| {
            let input = to_bytes(&rand_f32(comm.rank(), len));
            let mut output = vec![0u8; input.len()];
            kernel
                .compute(
                    &Tensor::new(types::F32, [len], &*input),
                    &mut Tensor::new(types::F32, [len], &mut *output),
                )
                .unwrap();
            output
        };
        let ans = to_bytes(&reference(2, len));
        run_ranks(comms, |comm| {
            let comm = Arc::new(comm);
            let kernel = AllReduce::with_policy(comm.clone(), SelectionPolicy::default());
            assert_eq!(round(&comm, &kernel), ans);

            comm.handle().barrier().unwrap();
            if comm.rank() == 0 {
                // rank 1 reallocates its staging memory behind everyone's back
                for handle in ipc.live_handles().iter().filter(|h| h.owner == 1) {
                    let old = ipc.open(handle).unwrap();
                    old.copy_in(0, &vec![SENTINEL; handle.size]);
                    assert!(ipc.revoke(handle));
                }
            }
            comm.handle().barrier().unwrap();

            assert_eq!(round(&comm, &kernel), ans);
        });
        assert_eq!(ipc.live_handles().len(), 0);
    }

    #[test]
    fn test_peer_memory_failure() {
        let group = LocalGroup::new(2).ipc(LocalIpc::with_limit(16));
        let comms = group.into_communicators().unwrap();
        run_ranks(comms, |comm| {
            let kernel = AllReduce::with_policy(Arc::new(comm), SelectionPolicy::default());
            let input = vec![0u8; 64];
            let mut output = vec![0u8; 64];
            let e = kernel
                .compute(
                    &Tensor::new(types::F32, [16], &*input),
                    &mut Tensor::new(types::F32, [16], &mut *output),
                )
                .unwrap_err();
            assert!(matches!(
                e,
                CollectiveError::PeerExchange(PeerError::OutOfMemory(128))
            ));
        });
    }

    #[test]
    fn test_length_mismatch() {
        let group = LocalGroup::with_ipc(2);
        let ipc = group.ipc_runtime().unwrap();
        let comms = group.into_communicators().unwrap();
        run_ranks(comms, |comm| {
            let len = 4 * (comm.rank() + 1);
            let kernel = AllReduce::with_policy(Arc::new(comm), SelectionPolicy::default());
            assert_eq!(kernel.path(len, WireType::Float32), ReducePath::OneShot);
            let input = to_bytes(&vec![1.; len]);
            let mut output = vec![0u8; input.len()];
            let e = kernel
                .compute(
                    &Tensor::new(types::F32, [len], &*input),
                    &mut Tensor::new(types::F32, [len], &mut *output),
                )
                .unwrap_err();
            assert!(matches!(
                e,
                CollectiveError::PeerExchange(PeerError::SizeMismatch { .. })
            ));
        });
        assert!(ipc.live_handles().is_empty());
    }

    #[test]
    fn test_peer_lost() {
        let mut comms = LocalGroup::with_ipc(2).into_communicators().unwrap();
        drop(comms.pop());
        let comm = comms.pop().unwrap();
        let input = to_bytes(&[1., 2.]);
        let mut output = vec![0u8; input.len()];
        let e = custom_all_reduce(
            &comm,
            &input,
            &mut output,
            WireType::Float32,
            ReducePath::OneShot,
            &mut IpcMemoryPack::default(),
        )
        .unwrap_err();
        assert!(matches!(
            e,
            CollectiveError::PeerExchange(PeerError::Exchange(TransportError::RemoteError))
        ));
    }
}
