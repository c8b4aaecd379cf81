use crate::WireType;
use std::ffi::c_int;
use thiserror::Error;

/// Failure codes reported by a collective transport.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum TransportError {
    #[error("a call to a device runtime function failed")]
    UnhandledDeviceError,
    #[error("a call to the system failed")]
    SystemError,
    #[error("an internal check failed; either a transport bug or memory corruption")]
    InternalError,
    #[error("an argument has an invalid value")]
    InvalidArgument,
    #[error("the transport was used incorrectly")]
    InvalidUsage,
    #[error("a peer failed or exited before the collective completed")]
    RemoteError,
}

/// Translates a raw library result code.
pub fn check(code: c_int) -> Result<(), TransportError> {
    match code {
        0 => Ok(()),
        1 => Err(TransportError::UnhandledDeviceError),
        2 => Err(TransportError::SystemError),
        3 => Err(TransportError::InternalError),
        4 => Err(TransportError::InvalidArgument),
        5 => Err(TransportError::InvalidUsage),
        6 => Err(TransportError::RemoteError),
        _ => Err(TransportError::InternalError),
    }
}

/// The standard collective substrate behind a communicator handle.
///
/// Buffers are byte slices of device memory. Every method is collective:
/// all ranks of the group must call it in the same order with
/// matching sizes.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn count(&self) -> usize;

    /// Element-wise sum of `src` (or of `dst` itself when `src` is `None`)
    /// across ranks, written to `dst` on every rank.
    fn all_reduce_sum(
        &self,
        dst: &mut [u8],
        src: Option<&[u8]>,
        ty: WireType,
    ) -> Result<(), TransportError>;

    /// Rank-ordered concatenation of every rank's chunk into `dst`.
    ///
    /// With `src == None` the local chunk is read in place from
    /// `dst[rank * chunk..]`.
    fn all_gather(&self, dst: &mut [u8], src: Option<&[u8]>) -> Result<(), TransportError>;

    /// Sends chunk `r` of `src` to rank `r`; chunk `r` of `dst` is what rank
    /// `r` sent here.
    fn all_to_all(&self, dst: &mut [u8], src: &[u8]) -> Result<(), TransportError>;

    fn barrier(&self) -> Result<(), TransportError>;

    /// Out-of-band gather of small host-side records, indexed by rank.
    fn exchange(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, TransportError>;
}

#[test]
fn test_check() {
    assert_eq!(check(0), Ok(()));
    assert_eq!(check(6), Err(TransportError::RemoteError));
    assert_eq!(check(4), Err(TransportError::InvalidArgument));
    assert_eq!(check(42), Err(TransportError::InternalError));
}
