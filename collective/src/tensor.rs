use digit_layout::DigitLayout;
use std::ops::{Deref, DerefMut};

/// Dense tensor descriptor over caller-owned storage.
///
/// `T` is normally `&[u8]` for inputs and `&mut [u8]` for outputs; the core
/// never keeps a descriptor beyond one call.
#[derive(Clone, Debug)]
pub struct Tensor<T> {
    dt: DigitLayout,
    shape: Vec<usize>,
    data: T,
}

impl<T: Deref<Target = [u8]>> Tensor<T> {
    pub fn new(dt: DigitLayout, shape: impl IntoIterator<Item = usize>, data: T) -> Self {
        let shape = shape.into_iter().collect::<Vec<_>>();
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>() * dt.nbytes(),
            "storage does not match shape {shape:?}",
        );
        Self { dt, shape, data }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn view(&self) -> Tensor<&[u8]> {
        Tensor {
            dt: self.dt,
            shape: self.shape.clone(),
            data: &self.data[..],
        }
    }
}

impl<T: DerefMut<Target = [u8]>> Tensor<T> {
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn view_mut(&mut self) -> Tensor<&mut [u8]> {
        Tensor {
            dt: self.dt,
            shape: self.shape.clone(),
            data: &mut self.data[..],
        }
    }
}

impl<T> Tensor<T> {
    #[inline]
    pub const fn dt(&self) -> DigitLayout {
        self.dt
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn nbytes(&self) -> usize {
        self.count() * self.dt.nbytes()
    }

    #[inline]
    pub fn take(self) -> T {
        self.data
    }
}

/// Resolves a possibly negative axis against `ndim` dimensions.
pub fn normalize_axis(axis: i64, ndim: usize) -> Option<usize> {
    let ndim = ndim as i64;
    let axis = if axis < 0 { axis + ndim } else { axis };
    (0..ndim).contains(&axis).then_some(axis as usize)
}
