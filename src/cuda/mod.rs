//! CUDA batched bitmask masker
//!
//! Device-side counterpart of [`crate::bitmask::apply_bitmask_batch`]:
//! a grid-stride kernel that applies packed disallowed bitmasks to a
//! batch of device-resident logit rows in place.
//!
//! Work distribution mirrors the host path: total work is
//! `num_rows * ceil(vocab_size / BLOCK_SIZE)` (row, block) units,
//! assigned to a fixed grid of one thread block per streaming
//! multiprocessor by striding, so blocks that finish a unit immediately
//! pick up the next one and every SM stays saturated regardless of the
//! row/block count ratio. Each unit writes only within its own
//! row/block, so write sets are disjoint and the kernel takes no locks.
//!
//! Dispatch is enqueue-and-return: calls return once the work is queued
//! on the device stream. Callers that need the masked values visible on
//! the host must [`synchronize`](CudaMasker::synchronize) first. The
//! kernel is compiled from CUDA C through NVRTC at masker construction.

use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{CudaDevice, CudaSlice, DriverError, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;

use crate::bitmask::{TokenBitmask, BLOCK_SIZE};
use crate::error::{BozalError, Result};
use crate::verbose;

/// Threads per block for the bitmask kernel
const THREADS_PER_BLOCK: u32 = 256;

/// CUDA C source of the bitmask-apply kernel.
///
/// One (row, block) work unit covers `block_tokens` contiguous token
/// positions; the grid strides over `num_rows * num_blocks` units.
/// Threads within a block cooperate over the unit's positions, each
/// loading the packed word covering its position and conditionally
/// storing `-inf`, bounds-checked against `vocab_size` (the last block
/// per row may be partial).
pub const MASK_KERNEL_SRC: &str = r#"
extern "C" __global__ void apply_token_bitmask(
    float* __restrict__ logits,
    const unsigned int* __restrict__ bitmask,
    const int* __restrict__ row_indices,
    unsigned int num_rows,
    unsigned int vocab_size,
    unsigned int words_per_row,
    unsigned int block_tokens
) {
    unsigned int num_blocks = (vocab_size + block_tokens - 1) / block_tokens;
    for (unsigned int work = blockIdx.x; work < num_rows * num_blocks; work += gridDim.x) {
        unsigned int row = work / num_blocks;
        unsigned int block = work % num_blocks;
        unsigned int batch_row = (unsigned int)row_indices[row];
        unsigned int base = block * block_tokens;

        for (unsigned int i = threadIdx.x; i < block_tokens; i += blockDim.x) {
            unsigned int pos = base + i;
            if (pos >= vocab_size) {
                break;
            }
            unsigned int word = bitmask[batch_row * words_per_row + (pos >> 5)];
            if ((word >> (pos & 31u)) & 1u) {
                // IEEE754 -inf; NVRTC compiles without libc headers
                logits[batch_row * vocab_size + pos] = __int_as_float(0xff800000U);
            }
        }
    }
}
"#;

fn gpu_err(context: &str, err: impl std::fmt::Display) -> BozalError {
    BozalError::Gpu {
        reason: format!("{context}: {err}"),
    }
}

/// Compiled bitmask kernel bound to one CUDA device
pub struct CudaMasker {
    device: Arc<CudaDevice>,
    num_sms: u32,
}

impl CudaMasker {
    const MODULE_NAME: &'static str = "bozal_mask";
    const FUNC_APPLY: &'static str = "apply_token_bitmask";

    /// Compile the kernel and bind it to device `ordinal`
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Gpu`] if the device cannot be opened or
    /// NVRTC compilation/loading fails.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal).map_err(|e| gpu_err("device init", e))?;
        let ptx = compile_ptx(MASK_KERNEL_SRC).map_err(|e| gpu_err("kernel compilation", e))?;
        device
            .load_ptx(ptx, Self::MODULE_NAME, &[Self::FUNC_APPLY])
            .map_err(|e| gpu_err("kernel load", e))?;
        let num_sms = device
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .map_err(|e| gpu_err("device attribute", e))? as u32;
        if verbose() {
            eprintln!("[cuda-mask] device {ordinal}: {num_sms} SMs");
        }
        Ok(Self { device, num_sms })
    }

    /// Whether any CUDA device can be opened on this host
    #[must_use]
    pub fn is_available() -> bool {
        CudaDevice::new(0).is_ok()
    }

    /// The bound device
    #[must_use]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Copy a host logits batch onto the device
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Gpu`] on allocation/transfer failure.
    pub fn upload_logits(&self, logits: &[f32]) -> Result<CudaSlice<f32>> {
        self.device
            .htod_copy(logits.to_vec())
            .map_err(|e| gpu_err("logits upload", e))
    }

    /// Copy a device logits batch back to the host, synchronizing first
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Gpu`] on transfer failure.
    pub fn download_logits(&self, logits: &CudaSlice<f32>) -> Result<Vec<f32>> {
        self.device
            .dtoh_sync_copy(logits)
            .map_err(|e| gpu_err("logits download", e))
    }

    /// Block until all queued device work has completed
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Gpu`] if the device reports a failure.
    pub fn synchronize(&self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(|e: DriverError| gpu_err("synchronize", e))
    }

    /// Apply a host-built bitmask to device-resident logits in place.
    ///
    /// Uploads the packed words and row indices, then enqueues the
    /// kernel and returns without synchronizing. `row_indices` selects
    /// which batch rows to mask (identity when `None`); row `i` of the
    /// bitmask masks batch row `i`.
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::InvalidShape`] on dimension mismatches
    /// (before any transfer) and [`BozalError::Gpu`] on driver failure.
    pub fn apply_bitmask_batch(
        &self,
        logits: &mut CudaSlice<f32>,
        bitmask: &TokenBitmask,
        row_indices: Option<&[u32]>,
    ) -> Result<()> {
        let vocab_size = bitmask.vocab_size();
        let num_rows = bitmask.num_rows();
        if vocab_size == 0 || logits.len() != num_rows * vocab_size {
            return Err(BozalError::InvalidShape {
                reason: format!(
                    "expected {} rows of {} logits on device, got {} values",
                    num_rows,
                    vocab_size,
                    logits.len()
                ),
            });
        }
        let indices: Vec<i32> = match row_indices {
            None => (0..num_rows as i32).collect(),
            Some(indices) => {
                for &index in indices {
                    if index as usize >= num_rows {
                        return Err(BozalError::InvalidShape {
                            reason: format!(
                                "row index {index} out of range for {num_rows} rows"
                            ),
                        });
                    }
                }
                indices.iter().map(|&i| i as i32).collect()
            }
        };

        let work_rows = indices.len() as u32;
        let d_bitmask = self
            .device
            .htod_copy(bitmask.as_words().to_vec())
            .map_err(|e| gpu_err("bitmask upload", e))?;
        let d_indices = self
            .device
            .htod_copy(indices)
            .map_err(|e| gpu_err("indices upload", e))?;

        self.launch(
            logits,
            &d_bitmask,
            &d_indices,
            work_rows,
            vocab_size as u32,
            bitmask.words_per_row() as u32,
        )
    }

    /// Enqueue the kernel over already-uploaded buffers
    fn launch(
        &self,
        logits: &mut CudaSlice<f32>,
        bitmask: &CudaSlice<u32>,
        row_indices: &CudaSlice<i32>,
        num_rows: u32,
        vocab_size: u32,
        words_per_row: u32,
    ) -> Result<()> {
        let func = self
            .device
            .get_func(Self::MODULE_NAME, Self::FUNC_APPLY)
            .ok_or_else(|| gpu_err("kernel lookup", "function not loaded"))?;

        // Fixed grid of one block per SM; the kernel strides over the
        // (row, block) work units.
        let config = LaunchConfig {
            grid_dim: (self.num_sms, 1, 1),
            block_dim: (THREADS_PER_BLOCK, 1, 1),
            shared_mem_bytes: 0,
        };

        // SAFETY: all buffers outlive the launch on this stream, the
        // kernel bounds-checks every store against vocab_size, and each
        // work unit's writes are confined to its own row/block.
        unsafe {
            func.launch(
                config,
                (
                    logits,
                    bitmask,
                    row_indices,
                    num_rows,
                    vocab_size,
                    words_per_row,
                    BLOCK_SIZE as u32,
                ),
            )
        }
        .map_err(|e| gpu_err("kernel launch", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmask::apply_bitmask_batch as apply_host;
    use serial_test::serial;

    fn has_cuda() -> bool {
        CudaMasker::is_available()
    }

    #[test]
    #[serial]
    fn test_device_apply_matches_host_apply() {
        if !has_cuda() {
            return;
        }
        let masker = CudaMasker::new(0).expect("masker");

        let vocab = 5000; // spans two partial blocks
        let rows = 3;
        let mut bitmask = TokenBitmask::zeros(rows, vocab);
        for id in 0..vocab {
            if id % 7 == 0 {
                bitmask.set_disallowed(0, id);
            }
            if id % 2 == 0 {
                bitmask.set_disallowed(2, id);
            }
        }

        let host_original: Vec<f32> = (0..rows * vocab).map(|i| (i % 97) as f32).collect();

        let mut expected = host_original.clone();
        apply_host(&mut expected, vocab, &bitmask, None).unwrap();

        let mut d_logits = masker.upload_logits(&host_original).unwrap();
        masker
            .apply_bitmask_batch(&mut d_logits, &bitmask, None)
            .unwrap();
        masker.synchronize().unwrap();
        let actual = masker.download_logits(&d_logits).unwrap();

        assert_eq!(actual, expected);
    }

    #[test]
    #[serial]
    fn test_device_apply_row_subset() {
        if !has_cuda() {
            return;
        }
        let masker = CudaMasker::new(0).expect("masker");

        let vocab = 64;
        let mut bitmask = TokenBitmask::zeros(2, vocab);
        bitmask.set_disallowed(0, 1);
        bitmask.set_disallowed(1, 2);

        let host: Vec<f32> = vec![1.0; 2 * vocab];
        let mut d_logits = masker.upload_logits(&host).unwrap();
        masker
            .apply_bitmask_batch(&mut d_logits, &bitmask, Some(&[1]))
            .unwrap();
        masker.synchronize().unwrap();
        let result = masker.download_logits(&d_logits).unwrap();

        assert!(result[..vocab].iter().all(|v| *v == 1.0));
        assert_eq!(result[vocab + 2], f32::NEG_INFINITY);
    }

    #[test]
    #[serial]
    fn test_device_apply_dimension_mismatch() {
        if !has_cuda() {
            return;
        }
        let masker = CudaMasker::new(0).expect("masker");
        let bitmask = TokenBitmask::zeros(2, 64);
        let mut d_logits = masker.upload_logits(&vec![0.0f32; 100]).unwrap();
        assert!(masker
            .apply_bitmask_batch(&mut d_logits, &bitmask, None)
            .is_err());
    }
}
