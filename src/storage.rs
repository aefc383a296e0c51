use ndarray::{ArrayD, ArrayView2, ArrayViewMut2, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::initializer::Init;

pub use handle::Handle;
mod handle {
    use super::*;

    /// Generic handle for accesing blocks of memory stored within the matching Storage
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Handle {
        start: usize,
        end: usize,
    }

    impl Handle {
        pub(super) fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn start(&self) -> usize {
            self.start
        }

        pub fn end(&self) -> usize {
            self.end
        }

        pub fn len(&self) -> usize {
            self.end - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }
    }
}

/// A parameter registered while building a network: where it lives, what shape it has
/// and how it is initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    handle: Handle,
    shape: Vec<usize>,
    init: Init,
    fan_in: usize,
}

impl Param {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn init(&self) -> Init {
        self.init
    }

    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }
}

pub use allocator::Allocator;
mod allocator {
    use super::*;

    /// Hands out contiguous blocks of parameter memory during construction.
    /// Nothing is actually allocated until a session binds the resulting length.
    #[derive(Debug, Clone, Default)]
    pub struct Allocator {
        len: usize,
        count: usize,
    }

    impl Allocator {
        pub fn new() -> Self {
            Default::default()
        }

        pub fn allocate(&mut self, shape: &[usize], init: Init, fan_in: usize) -> Param {
            let size: usize = shape.iter().product();
            let handle = Handle::new(self.len, self.len + size);
            self.len += size;
            self.count += 1;
            Param {
                handle,
                shape: shape.to_vec(),
                init,
                fan_in,
            }
        }

        /// Total number of scalars allocated so far.
        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        /// Number of parameters allocated so far.
        pub fn param_count(&self) -> usize {
            self.count
        }
    }
}

pub use storage::Storage;
mod storage {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct Storage {
        storage: Box<[f32]>,
    }

    impl Storage {
        pub fn zeroed(len: usize) -> Self {
            Self {
                storage: vec![0.; len].into_boxed_slice(),
            }
        }

        pub fn len(&self) -> usize {
            self.storage.len()
        }

        pub fn is_empty(&self) -> bool {
            self.storage.is_empty()
        }

        pub fn get(&self, handle: Handle) -> &[f32] {
            &self.storage[handle.start()..handle.end()]
        }

        pub fn get_mut(&mut self, handle: Handle) -> &mut [f32] {
            &mut self.storage[handle.start()..handle.end()]
        }

        /// Copy a parameter's current value out of the storage.
        pub fn array(&self, param: &Param) -> Result<ArrayD<f32>> {
            ArrayD::from_shape_vec(IxDyn(param.shape()), self.get(param.handle()).to_vec())
                .map_err(|e| Error::Shape(e.to_string()))
        }

        /// View a rank 2 parameter (or a rank 1 parameter as a single row).
        pub fn matrix(&self, param: &Param) -> Result<ArrayView2<'_, f32>> {
            ArrayView2::from_shape(matrix_dims(param)?, self.get(param.handle()))
                .map_err(|e| Error::Shape(e.to_string()))
        }

        pub fn matrix_mut(&mut self, param: &Param) -> Result<ArrayViewMut2<'_, f32>> {
            let dims = matrix_dims(param)?;
            ArrayViewMut2::from_shape(dims, self.get_mut(param.handle()))
                .map_err(|e| Error::Shape(e.to_string()))
        }

        /// Overwrite a parameter's value. The shape is checked before anything is written.
        pub fn assign(&mut self, param: &Param, value: &ArrayD<f32>) -> Result<()> {
            check_value_shape(param, value)?;
            for (dst, src) in self.get_mut(param.handle()).iter_mut().zip(value.iter()) {
                *dst = *src;
            }
            Ok(())
        }

        /// Zero out the entire storage.
        pub fn clear(&mut self) {
            self.storage.iter_mut().for_each(|x| *x = 0.);
        }

        /// Get a reference to the raw contents of the storage
        pub fn raw(&self) -> &[f32] {
            &self.storage
        }

        /// Get a mutable reference to the raw contents of the storage
        pub fn raw_mut(&mut self) -> &mut [f32] {
            &mut self.storage
        }
    }

    fn matrix_dims(param: &Param) -> Result<(usize, usize)> {
        match *param.shape() {
            [n] => Ok((1, n)),
            [r, c] => Ok((r, c)),
            ref s => Err(Error::Shape(format!(
                "Parameter of shape {:?} cannot be viewed as a matrix.",
                s
            ))),
        }
    }
}

/// Fail if `value` cannot be assigned to `param`.
pub fn check_value_shape(param: &Param, value: &ArrayD<f32>) -> Result<()> {
    if value.shape() != param.shape() {
        return Err(Error::Shape(format!(
            "Wrong parameter shape: {:?} instead of {:?}.",
            value.shape(),
            param.shape()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn allocations_are_contiguous() {
        let mut alloc = Allocator::new();
        let a = alloc.allocate(&[3, 2], Init::Xavier, 3);
        let b = alloc.allocate(&[2], Init::Zeros, 3);
        assert_eq!(a.handle().start(), 0);
        assert_eq!(a.handle().end(), 6);
        assert_eq!(b.handle().start(), 6);
        assert_eq!(alloc.len(), 8);
        assert_eq!(alloc.param_count(), 2);
    }

    #[test]
    fn assign_and_read_back() {
        let mut alloc = Allocator::new();
        let w = alloc.allocate(&[2, 2], Init::Zeros, 2);
        let mut storage = Storage::zeroed(alloc.len());

        let value = array![[1., 2.], [3., 4.]].into_dyn();
        storage.assign(&w, &value).unwrap();
        assert_eq!(storage.array(&w).unwrap(), value);
        assert_eq!(storage.matrix(&w).unwrap()[[1, 0]], 3.);
    }

    #[test]
    fn assign_rejects_wrong_shape() {
        let mut alloc = Allocator::new();
        let w = alloc.allocate(&[2, 2], Init::Zeros, 2);
        let mut storage = Storage::zeroed(alloc.len());

        let value = array![1., 2., 3., 4.].into_dyn();
        assert!(matches!(storage.assign(&w, &value), Err(Error::Shape(_))));
        assert_eq!(storage.raw(), &[0.; 4]);
    }
}
