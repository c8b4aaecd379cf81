use crate::WireType;
use log::trace;
use std::env;

/// How an all-reduce is carried out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ReducePath {
    /// Nothing to exchange, the input is the result.
    PassThrough,
    /// The transport's own sum primitive.
    Standard,
    /// Every rank reads every peer's staging buffer and reduces all of it.
    OneShot,
    /// Every rank reduces one slice, then gathers the reduced slices.
    TwoShot,
}

/// Where the ranks of a communicator live.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Topology {
    pub world_size: usize,
    /// Ranks sharing this rank's node.
    pub local_size: usize,
    /// Whether a peer memory runtime is attached.
    pub peer_access: bool,
}

impl Topology {
    #[inline]
    pub fn single_node(&self) -> bool {
        self.local_size == self.world_size
    }
}

/// Size limits for one range of world sizes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Tier {
    /// Tier applies to world sizes up to this value.
    pub max_world: usize,
    /// Messages below this many bytes use [`ReducePath::OneShot`].
    pub one_shot_below: usize,
    /// Messages below this many bytes use [`ReducePath::TwoShot`] when
    /// the element count splits evenly over the ranks.
    pub two_shot_below: usize,
}

/// Tunable rules choosing between the custom and standard reduction paths.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SelectionPolicy {
    pub enabled: bool,
    /// Hard cap on the message size of the custom path.
    pub max_bytes: usize,
    /// World sizes the custom path supports.
    pub world_sizes: Vec<usize>,
    /// Sorted by `max_world`.
    pub tiers: Vec<Tier>,
}

const ENV_ENABLE: &str = "COLLECTIVE_CUSTOM_ALL_REDUCE";
const ENV_MAX_BYTES: &str = "COLLECTIVE_CUSTOM_ALL_REDUCE_MAX_BYTES";

const KB: usize = 1000;
const MB: usize = 1000 * KB;

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 16 * MB,
            world_sizes: vec![2, 4, 8],
            tiers: vec![
                Tier {
                    max_world: 2,
                    one_shot_below: 16 * MB,
                    two_shot_below: 0,
                },
                Tier {
                    max_world: 4,
                    one_shot_below: MB,
                    two_shot_below: 8 * MB,
                },
                Tier {
                    max_world: 8,
                    one_shot_below: 512 * KB,
                    two_shot_below: 8 * MB,
                },
            ],
        }
    }
}

impl SelectionPolicy {
    /// The standard path only.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Default policy adjusted by the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut ans = Self::default();
        if let Some(value) = var(ENV_ENABLE) {
            ans.enabled = !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            )
        }
        if let Some(value) = var(ENV_MAX_BYTES) {
            match value.trim().parse() {
                Ok(max) => ans.max_bytes = max,
                Err(_) => log::warn!("ignore {ENV_MAX_BYTES}={value}: not a byte count"),
            }
        }
        ans
    }

    /// Picks the path for reducing `count` elements of type `ty`.
    ///
    /// Pure: depends only on its arguments, so every rank reaches the same
    /// decision.
    pub fn select(&self, count: usize, ty: WireType, topo: &Topology) -> ReducePath {
        let ans = self.select_impl(count, ty, topo);
        trace!("select {ans:?} for {count} x {} on {topo:?}", ty.name());
        ans
    }

    fn select_impl(&self, count: usize, ty: WireType, topo: &Topology) -> ReducePath {
        if topo.world_size == 1 {
            return ReducePath::PassThrough;
        }
        if !self.enabled
            || !custom_type(ty)
            || !topo.single_node()
            || !topo.peer_access
            || !self.world_sizes.contains(&topo.world_size)
        {
            return ReducePath::Standard;
        }
        let bytes = count * ty.size();
        if bytes == 0 || bytes > self.max_bytes {
            return ReducePath::Standard;
        }
        let Some(tier) = self.tiers.iter().find(|t| topo.world_size <= t.max_world) else {
            return ReducePath::Standard;
        };
        if bytes < tier.one_shot_below {
            ReducePath::OneShot
        } else if bytes < tier.two_shot_below && count % topo.world_size == 0 {
            ReducePath::TwoShot
        } else {
            ReducePath::Standard
        }
    }
}

/// Element types the peer memory kernels reduce.
#[inline]
fn custom_type(ty: WireType) -> bool {
    matches!(
        ty,
        WireType::Float16 | WireType::Float32 | WireType::Int32 | WireType::Int64
    )
}
