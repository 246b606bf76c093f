//! Buffer adapter and converter registry
//!
//! Normalizes a numeric-array handle of unknown concrete type into a
//! contiguous, mutable, host-reachable `f32` view. Converters are
//! registered in priority order in a process-lifetime table; the first
//! converter that recognizes the handle's type wins. Ecosystems that are
//! not compiled in simply never register a converter — that path is
//! silently disabled, not an error.
//!
//! Built-in converters recognize [`LogitsTensor`] (normalizing `f64`
//! storage to `f32` in place when needed) and plain `Vec<f32>` handles.

use std::any::Any;
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{BozalError, Result};
use crate::tensor::LogitsTensor;

/// Required alignment of `f32` logit buffers, in bytes
pub const LOGITS_ALIGN: usize = 4;

/// Required alignment of `i64` token-id buffers, in bytes
pub const ID_ALIGN: usize = 8;

/// Where a logits buffer's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Ordinary host memory
    Host,
    /// Accelerator device memory; index buffers destined for it should
    /// use pinned host staging
    Accelerator,
}

/// A contiguous, mutable, host-reachable `f32` view over a logits
/// buffer, produced by a [`SliceConverter`].
///
/// The view borrows the handle for the duration of a single masking
/// call; the core never retains it across calls.
#[derive(Debug)]
pub struct BufferView<'a> {
    data: &'a mut [f32],
    placement: Placement,
}

impl<'a> BufferView<'a> {
    /// Wrap a host-resident `f32` slice
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Misaligned`] if the slice start violates
    /// the 4-byte alignment contract (defensive; indicates a broken
    /// allocator).
    pub fn from_slice(data: &'a mut [f32]) -> Result<Self> {
        Self::with_placement(data, Placement::Host)
    }

    /// Wrap a `f32` slice with an explicit destination placement
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Misaligned`] on an alignment violation.
    pub fn with_placement(data: &'a mut [f32], placement: Placement) -> Result<Self> {
        let addr = data.as_ptr() as usize;
        if addr % LOGITS_ALIGN != 0 {
            return Err(BozalError::Misaligned {
                addr,
                required: LOGITS_ALIGN,
            });
        }
        Ok(Self { data, placement })
    }

    /// Number of `f32` elements in the view
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the view is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Destination placement of the underlying logits
    #[must_use]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Mutable access to the viewed elements
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.data
    }

    /// Consume the view, returning the underlying slice borrow
    #[must_use]
    pub fn into_slice(self) -> &'a mut [f32] {
        self.data
    }
}

/// Converts handles of one concrete numeric-array type into
/// [`BufferView`]s.
///
/// Implementors downcast the handle, enforce dtype/contiguity/shape
/// preconditions (materializing a normalized copy inside the handle only
/// when preconditions are unmet), and expose the storage as a mutable
/// `f32` view.
pub trait SliceConverter: Send + Sync {
    /// Whether this converter recognizes the handle's concrete type
    fn matches(&self, handle: &dyn Any) -> bool;

    /// Convert a matching handle into a contiguous `f32` view
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::InvalidShape`] for unsupported ranks and
    /// [`BozalError::Misaligned`] for alignment-contract violations.
    fn convert<'a>(&self, handle: &'a mut dyn Any) -> Result<BufferView<'a>>;
}

/// Built-in converter for [`LogitsTensor`] handles
struct TensorConverter;

impl SliceConverter for TensorConverter {
    fn matches(&self, handle: &dyn Any) -> bool {
        handle.is::<LogitsTensor>()
    }

    fn convert<'a>(&self, handle: &'a mut dyn Any) -> Result<BufferView<'a>> {
        let Some(tensor) = handle.downcast_mut::<LogitsTensor>() else {
            return Err(BozalError::UnsupportedType {
                type_id: "expected LogitsTensor".to_string(),
            });
        };
        let shape = tensor.shape();
        let rank_supported = shape.len() == 1 || (shape.len() == 2 && shape[0] == 1);
        if !rank_supported {
            return Err(BozalError::InvalidShape {
                reason: format!("only shapes (n) and (1, n) are supported, got {shape:?}"),
            });
        }
        tensor.promote_to_f32();
        let data = tensor.as_f32_mut().expect("storage just promoted to f32");
        BufferView::from_slice(data)
    }
}

/// Built-in converter for plain `Vec<f32>` handles (shape `(n,)`)
struct VecConverter;

impl SliceConverter for VecConverter {
    fn matches(&self, handle: &dyn Any) -> bool {
        handle.is::<Vec<f32>>()
    }

    fn convert<'a>(&self, handle: &'a mut dyn Any) -> Result<BufferView<'a>> {
        let Some(data) = handle.downcast_mut::<Vec<f32>>() else {
            return Err(BozalError::UnsupportedType {
                type_id: "expected Vec<f32>".to_string(),
            });
        };
        BufferView::from_slice(data.as_mut_slice())
    }
}

type Registry = RwLock<Vec<Box<dyn SliceConverter>>>;

static CONVERTERS: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    CONVERTERS.get_or_init(|| RwLock::new(vec![Box::new(TensorConverter), Box::new(VecConverter)]))
}

/// Register a converter for an additional numeric-array ecosystem.
///
/// Converters are consulted in registration order after the built-ins;
/// the first match wins. Intended to be called once at process start.
pub fn register_converter(converter: Box<dyn SliceConverter>) {
    registry()
        .write()
        .expect("converter registry poisoned")
        .push(converter);
}

/// Normalize an opaque logits handle into a contiguous `f32` view.
///
/// Handles that required conversion (e.g. `f64` storage) are normalized
/// in place, so the same handle holds the masked result afterwards.
///
/// # Errors
///
/// Returns [`BozalError::UnsupportedType`] when no registered converter
/// recognizes the handle's type, or whatever error the matching
/// converter reports.
pub fn convert_logits<'a>(handle: &'a mut dyn Any) -> Result<BufferView<'a>> {
    let converters = registry().read().expect("converter registry poisoned");
    let position = converters.iter().position(|c| c.matches(&*handle));
    match position {
        Some(idx) => converters[idx].convert(handle),
        None => Err(BozalError::UnsupportedType {
            type_id: format!("{:?}", (*handle).type_id()),
        }),
    }
}
