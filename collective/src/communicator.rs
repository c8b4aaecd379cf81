use crate::{CollectiveError, IpcRuntime, Topology, Transport};
use log::debug;
use std::{env, fmt, sync::Arc};

/// Placement of this process as told by the launcher.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LaunchEnv {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub local_size: usize,
}

const RANK: &[&str] = &["OMPI_COMM_WORLD_RANK", "PMI_RANK", "RANK"];
const WORLD_SIZE: &[&str] = &["OMPI_COMM_WORLD_SIZE", "PMI_SIZE", "WORLD_SIZE"];
const LOCAL_RANK: &[&str] = &["OMPI_COMM_WORLD_LOCAL_RANK", "LOCAL_RANK"];
const LOCAL_SIZE: &[&str] = &["OMPI_COMM_WORLD_LOCAL_SIZE", "LOCAL_WORLD_SIZE"];

impl LaunchEnv {
    /// Reads the launch convention of the current process.
    pub fn from_env() -> Result<Self, CollectiveError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, CollectiveError> {
        let lookup = |keys: &[&str]| -> Result<Option<usize>, CollectiveError> {
            let Some((key, value)) = keys.iter().find_map(|&k| var(k).map(|v| (k, v))) else {
                return Ok(None);
            };
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| init_error(format!("{key}={value} is not an index")))
        };

        let rank = lookup(RANK)?.ok_or_else(|| init_error("rank is not set by the launcher"))?;
        let world_size =
            lookup(WORLD_SIZE)?.ok_or_else(|| init_error("world size is not set by the launcher"))?;
        let local_size = lookup(LOCAL_SIZE)?.unwrap_or(world_size);
        if local_size == 0 {
            return Err(init_error("local size is zero"));
        }
        let local_rank = lookup(LOCAL_RANK)?.unwrap_or(rank % local_size);

        let ans = Self {
            rank,
            world_size,
            local_rank,
            local_size,
        };
        ans.check()?;
        Ok(ans)
    }

    fn check(&self) -> Result<(), CollectiveError> {
        if self.world_size == 0 {
            return Err(init_error("world size is zero"));
        }
        if self.rank >= self.world_size {
            return Err(init_error(format!(
                "rank {} out of world size {}",
                self.rank, self.world_size
            )));
        }
        if self.local_size == 0 || self.local_size > self.world_size {
            return Err(init_error(format!(
                "local size {} inconsistent with world size {}",
                self.local_size, self.world_size
            )));
        }
        if self.local_rank >= self.local_size {
            return Err(init_error(format!(
                "local rank {} out of local size {}",
                self.local_rank, self.local_size
            )));
        }
        Ok(())
    }
}

#[inline]
fn init_error(msg: impl fmt::Display) -> CollectiveError {
    CollectiveError::Initialization(msg.to_string())
}

/// Membership of this process in the fixed collective group.
///
/// Built once per process and shared by every collective kernel through an
/// [`Arc`]. Dropping it destroys the transport handle.
pub struct Communicator {
    env: LaunchEnv,
    transport: Box<dyn Transport>,
    ipc: Option<Arc<dyn IpcRuntime>>,
}

impl Communicator {
    /// Binds an established transport to the launch placement.
    pub fn init(
        env: LaunchEnv,
        transport: Box<dyn Transport>,
        ipc: Option<Arc<dyn IpcRuntime>>,
    ) -> Result<Self, CollectiveError> {
        env.check()?;
        if transport.count() != env.world_size {
            return Err(init_error(format!(
                "transport has {} ranks, launcher expects {}",
                transport.count(),
                env.world_size
            )));
        }
        if transport.rank() != env.rank {
            return Err(init_error(format!(
                "transport assigned rank {}, launcher expects {}",
                transport.rank(),
                env.rank
            )));
        }
        debug!(
            "rank {}/{} joined (local {}/{}, peer memory: {})",
            env.rank,
            env.world_size,
            env.local_rank,
            env.local_size,
            ipc.is_some()
        );
        Ok(Self {
            env,
            transport,
            ipc,
        })
    }

    /// Discovers the placement from the environment and lets `connect`
    /// establish the transport for it.
    pub fn from_env<E>(
        connect: impl FnOnce(&LaunchEnv) -> Result<Box<dyn Transport>, E>,
        ipc: Option<Arc<dyn IpcRuntime>>,
    ) -> Result<Self, CollectiveError>
    where
        E: fmt::Display,
    {
        let env = LaunchEnv::from_env()?;
        let transport = connect(&env).map_err(init_error)?;
        Self::init(env, transport, ipc)
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.env.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.env.world_size
    }

    #[inline]
    pub fn local_rank(&self) -> usize {
        self.env.local_rank
    }

    #[inline]
    pub fn local_size(&self) -> usize {
        self.env.local_size
    }

    #[inline]
    pub fn handle(&self) -> &dyn Transport {
        &*self.transport
    }

    #[inline]
    pub fn ipc(&self) -> Option<&Arc<dyn IpcRuntime>> {
        self.ipc.as_ref()
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        Topology {
            world_size: self.env.world_size,
            local_size: self.env.local_size,
            peer_access: self.ipc.is_some(),
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        debug!("rank {} leaves the group", self.env.rank)
    }
}
