/*!
Device buffers.

A [`DeviceBuffer`] is a region of device memory with an [`AccessMode`]. The access mode
describes how kernels may use the buffer. Uploads are always permitted, downloads are
rejected for [`ReadOnly`](AccessMode::ReadOnly) buffers:

```
# use clpipe::{result::Result, buffer::{AccessMode, DeviceBuffer}, context::ExecutionContext};
# use clpipe::{device::{DeviceKind, DeviceRegistry}, future::Completion};
# fn main() -> Result<()> {
# let device = DeviceRegistry::builder().build()?.select_first(DeviceKind::Gpu)?;
let context = ExecutionContext::create(&device)?;
let buffer = DeviceBuffer::allocate_for::<u32>(&context, 3, AccessMode::WriteOnly)?;
buffer.upload_from(&[1u32, 2, 3], 0, Completion::Blocking)?.wait()?;
let mut host = [0u32; 2];
buffer.download_to(&mut host, 4, Completion::Blocking)?.wait()?;
assert_eq!(host, [2, 3]);
# Ok(())
# }
```
*/

use crate::{
    context::{ContextShared, ExecutionContext, Owned, Resource},
    device::RawBuffer,
    error::{codes::CL_INVALID_BUFFER_SIZE, Error},
    future::{Completion, PendingBytes, PendingRead, PendingWork},
    result::Result,
    scalar::Scalar,
};
use derive_more::Display;
use std::{
    fmt::{self, Debug},
    mem::size_of,
    sync::Arc,
};

/// How kernels may access a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum AccessMode {
    /// Kernels only read, the buffer can not be downloaded.
    #[display(fmt = "read-only")]
    ReadOnly,
    /// Kernels only write.
    #[display(fmt = "write-only")]
    WriteOnly,
    /// Kernels read and write.
    #[display(fmt = "read-write")]
    ReadWrite,
}

impl AccessMode {
    /// Whether the buffer can be transferred in `direction`.
    pub fn permits(&self, direction: Direction) -> bool {
        !(direction == Direction::Download && *self == Self::ReadOnly)
    }
}

/// Transfer directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Direction {
    /// Host to device.
    #[display(fmt = "upload")]
    Upload,
    /// Device to host.
    #[display(fmt = "download")]
    Download,
}

/// A device allocation.
pub struct DeviceBuffer {
    size: usize,
    access: AccessMode,
    owned: Owned<RawBuffer>,
}

impl DeviceBuffer {
    /** Allocates `size_in_bytes` bytes on the device of `context`.

    The contents are unspecified until uploaded. A zero sized buffer is not allocated on the
    device, see [`is_empty`](Self::is_empty).

    **errors**
    - [`AllocationFailed`](Error::AllocationFailed) if the allocation exceeds the per
    allocation limit or the remaining device memory. */
    pub fn allocate(
        context: &ExecutionContext,
        size_in_bytes: usize,
        access: AccessMode,
    ) -> Result<Self> {
        let shared = context.shared();
        let raw = shared.with_context(|raw| raw.allocate(size_in_bytes, access))?;
        let owned = Owned::new(shared, Resource::Buffer, raw);
        log::debug!(
            "allocated buffer {} of {size_in_bytes} bytes ({access})",
            owned.id()
        );
        Ok(Self {
            size: size_in_bytes,
            access,
            owned,
        })
    }
    /// Allocates a buffer for `len` elements of `T`.
    ///
    /// See [`allocate`](Self::allocate).
    pub fn allocate_for<T: Scalar>(
        context: &ExecutionContext,
        len: usize,
        access: AccessMode,
    ) -> Result<Self> {
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or(Error::AllocationFailed {
                bytes: usize::MAX,
                code: CL_INVALID_BUFFER_SIZE,
            })?;
        Self::allocate(context, bytes, access)
    }
    /// The size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.size
    }
    /// The access mode.
    pub fn access(&self) -> AccessMode {
        self.access
    }
    /// Whether the size is zero.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
    /// The number of whole elements of `T` that fit in the buffer.
    pub fn len_of<T: Scalar>(&self) -> usize {
        self.size / size_of::<T>()
    }
    fn check(&self, direction: Direction, offset: usize, len: usize) -> Result<()> {
        if !self.access.permits(direction) {
            return Err(Error::AccessModeViolation {
                access: self.access,
                direction,
            });
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::TransferOutOfBounds {
                direction,
                offset,
                len,
                size: self.size,
            }),
        }
    }
    /** Copies `data` into the buffer at `byte_offset`.

    With [`Completion::Deferred`] the data is staged and `data` can be reused immediately.

    **errors**
    - [`TransferOutOfBounds`](Error::TransferOutOfBounds) if `data` does not fit.
    - [`SubmissionFailed`](Error::SubmissionFailed) if the platform rejects the write. */
    pub fn upload_from<T: Scalar>(
        &self,
        data: &[T],
        byte_offset: usize,
        completion: Completion,
    ) -> Result<PendingWork> {
        let raw = self.owned.get()?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check(Direction::Upload, byte_offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(PendingWork::ready());
        }
        log::trace!(
            "upload {} bytes to buffer {} at {byte_offset}",
            bytes.len(),
            self.owned.id()
        );
        self.owned
            .context()
            .with_queue(|queue| queue.upload(raw, byte_offset, bytes, completion))
    }
    /** Copies from the buffer at `byte_offset` into `host`.

    `host` is written when the returned [`PendingRead`] is joined.

    **errors**
    - [`AccessModeViolation`](Error::AccessModeViolation) if the buffer is read-only.
    - [`TransferOutOfBounds`](Error::TransferOutOfBounds) if `host` does not fit.
    - [`SubmissionFailed`](Error::SubmissionFailed) if the platform rejects the read. */
    pub fn download_to<'a, T: Scalar>(
        &self,
        host: &'a mut [T],
        byte_offset: usize,
        completion: Completion,
    ) -> Result<PendingRead<'a, T>> {
        let raw = self.owned.get()?;
        let len = host.len() * size_of::<T>();
        self.check(Direction::Download, byte_offset, len)?;
        if len == 0 {
            return Ok(PendingRead::new(host, PendingBytes::ready(Vec::new())));
        }
        log::trace!(
            "download {len} bytes from buffer {} at {byte_offset}",
            self.owned.id()
        );
        let bytes = self
            .owned
            .context()
            .with_queue(|queue| queue.download(raw, byte_offset, len, completion))?;
        Ok(PendingRead::new(host, bytes))
    }
    pub(crate) fn raw(&self) -> Result<&RawBuffer> {
        self.owned.get()
    }
    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        self.owned.context()
    }
    /// Frees the allocation.
    pub fn release(mut self) -> Result<()> {
        log::debug!("releasing buffer {}", self.owned.id());
        self.owned.release()
    }
}

impl Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.owned.id())
            .field("size", &self.size)
            .field("access", &self.access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceKind, DeviceRegistry, SimDevice},
        error::codes::CL_MEM_OBJECT_ALLOCATION_FAILURE,
    };

    fn context() -> ExecutionContext {
        let device = DeviceRegistry::builder()
            .sim_devices([SimDevice::gpu().with_global_mem_size(4096)])
            .build()
            .unwrap()
            .select_first(DeviceKind::Gpu)
            .unwrap();
        ExecutionContext::create(&device).unwrap()
    }

    #[test]
    fn round_trip() {
        let context = context();
        for access in [AccessMode::ReadWrite, AccessMode::WriteOnly] {
            let buffer = DeviceBuffer::allocate_for::<i16>(&context, 5, access).unwrap();
            assert_eq!(buffer.size_in_bytes(), 10);
            assert_eq!(buffer.len_of::<u32>(), 2);
            let data = [-1i16, 2, -3, 4, -5];
            buffer
                .upload_from(&data, 0, Completion::Deferred)
                .unwrap()
                .wait()
                .unwrap();
            let mut host = [0i16; 5];
            let read = buffer
                .download_to(&mut host, 0, Completion::Deferred)
                .unwrap();
            assert_eq!(read.wait().unwrap(), &data);
            buffer.release().unwrap();
        }
    }

    #[test]
    fn read_only_buffers_can_not_be_downloaded() {
        let context = context();
        let buffer = DeviceBuffer::allocate(&context, 8, AccessMode::ReadOnly).unwrap();
        buffer
            .upload_from(&[1u8; 8], 0, Completion::Blocking)
            .unwrap()
            .wait()
            .unwrap();
        let mut host = [0u8; 0];
        assert_eq!(
            buffer
                .download_to(&mut host, 0, Completion::Blocking)
                .unwrap_err(),
            Error::AccessModeViolation {
                access: AccessMode::ReadOnly,
                direction: Direction::Download,
            }
        );
    }

    #[test]
    fn transfers_are_bounded() {
        let context = context();
        let buffer = DeviceBuffer::allocate(&context, 8, AccessMode::ReadWrite).unwrap();
        assert_eq!(
            buffer
                .upload_from(&[0u32; 2], 4, Completion::Blocking)
                .unwrap_err(),
            Error::TransferOutOfBounds {
                direction: Direction::Upload,
                offset: 4,
                len: 8,
                size: 8,
            }
        );
        let mut host = [0u8; 1];
        assert!(matches!(
            buffer.download_to(&mut host, usize::MAX, Completion::Blocking),
            Err(Error::TransferOutOfBounds { .. })
        ));
    }

    #[test]
    fn empty_buffers() {
        let context = context();
        let buffer = DeviceBuffer::allocate(&context, 0, AccessMode::ReadWrite).unwrap();
        assert!(buffer.is_empty());
        assert!(buffer
            .upload_from::<u8>(&[], 0, Completion::Blocking)
            .unwrap()
            .is_ready());
        assert!(matches!(
            buffer.upload_from(&[1u8], 0, Completion::Blocking),
            Err(Error::TransferOutOfBounds { .. })
        ));
    }

    #[test]
    fn allocations_are_limited() {
        let context = context();
        // a single allocation is limited to a quarter of global memory
        assert_eq!(
            DeviceBuffer::allocate(&context, 1025, AccessMode::ReadWrite).unwrap_err(),
            Error::AllocationFailed {
                bytes: 1025,
                code: CL_INVALID_BUFFER_SIZE,
            }
        );
        let buffers: Vec<DeviceBuffer> = (0..4)
            .map(|_| DeviceBuffer::allocate(&context, 1024, AccessMode::ReadWrite).unwrap())
            .collect();
        assert_eq!(
            DeviceBuffer::allocate(&context, 1, AccessMode::ReadWrite).unwrap_err(),
            Error::AllocationFailed {
                bytes: 1,
                code: CL_MEM_OBJECT_ALLOCATION_FAILURE,
            }
        );
        for buffer in buffers {
            buffer.release().unwrap();
        }
        DeviceBuffer::allocate(&context, 1, AccessMode::ReadWrite)
            .unwrap()
            .release()
            .unwrap();
    }

    #[test]
    fn context_outlives_buffers() {
        let context = context();
        let log = context.lifecycle();
        let buffer = DeviceBuffer::allocate(&context, 4, AccessMode::ReadWrite).unwrap();
        assert_eq!(
            context.release().unwrap_err(),
            Error::ContextInUse { dependents: 1 }
        );
        assert!(log.released().is_empty());
        buffer
            .upload_from(&[7u8; 4], 0, Completion::Blocking)
            .unwrap()
            .wait()
            .unwrap();
        let mut host = [0u8; 4];
        buffer
            .download_to(&mut host, 0, Completion::Blocking)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(host, [7; 4]);
        buffer.release().unwrap();
        assert_eq!(
            log.released(),
            [
                (Resource::Buffer, 2),
                (Resource::Queue, 1),
                (Resource::Context, 0)
            ]
        );
    }
}
