use crate::CollectiveError;
use digit_layout::{DigitLayout, types};
use half::f16;

/// Element type tag understood by the transport, one per reducible layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum WireType {
    Int8,
    Uint8,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float16,
    Float32,
    Float64,
}

impl WireType {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Float16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

/// Maps a tensor element type to its wire type.
///
/// Collective libraries hang or corrupt data when ranks disagree on the
/// element type, so callers must run this before touching the transport.
pub fn convert(dt: DigitLayout) -> Result<WireType, CollectiveError> {
    Ok(match dt {
        types::I8 => WireType::Int8,
        types::U8 => WireType::Uint8,
        types::I32 => WireType::Int32,
        types::U32 => WireType::Uint32,
        types::I64 => WireType::Int64,
        types::U64 => WireType::Uint64,
        types::F16 => WireType::Float16,
        types::F32 => WireType::Float32,
        types::F64 => WireType::Float64,
        _ => return Err(CollectiveError::UnsupportedType(dt)),
    })
}

trait Element: Copy {
    const SIZE: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
    fn add(self, rhs: Self) -> Self;
}

macro_rules! int_element {
    ($($ty:ty),+) => {
        $(
            impl Element for $ty {
                const SIZE: usize = size_of::<$ty>();
                #[inline]
                fn load(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
                #[inline]
                fn store(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes())
                }
                #[inline]
                fn add(self, rhs: Self) -> Self {
                    self.wrapping_add(rhs)
                }
            }
        )+
    };
}

macro_rules! float_element {
    ($($ty:ty),+) => {
        $(
            impl Element for $ty {
                const SIZE: usize = size_of::<$ty>();
                #[inline]
                fn load(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
                #[inline]
                fn store(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes())
                }
                #[inline]
                fn add(self, rhs: Self) -> Self {
                    self + rhs
                }
            }
        )+
    };
}

int_element!(i8, u8, i32, u32, i64, u64);
float_element!(f16, f32, f64);

fn accumulate_as<T: Element>(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        T::load(d).add(T::load(s)).store(d)
    }
}

/// `dst[i] += src[i]` for every element, interpreting both as `ty`.
///
/// Every reduction in the crate funnels through here, always folding ranks
/// in ascending order, so all paths produce the same bits.
pub fn accumulate(dst: &mut [u8], src: &[u8], ty: WireType) {
    assert_eq!(dst.len(), src.len());
    assert_eq!(dst.len() % ty.size(), 0);
    match ty {
        WireType::Int8 => accumulate_as::<i8>(dst, src),
        WireType::Uint8 => accumulate_as::<u8>(dst, src),
        WireType::Int32 => accumulate_as::<i32>(dst, src),
        WireType::Uint32 => accumulate_as::<u32>(dst, src),
        WireType::Int64 => accumulate_as::<i64>(dst, src),
        WireType::Uint64 => accumulate_as::<u64>(dst, src),
        WireType::Float16 => accumulate_as::<f16>(dst, src),
        WireType::Float32 => accumulate_as::<f32>(dst, src),
        WireType::Float64 => accumulate_as::<f64>(dst, src),
    }
}
