/*!
Completion of submitted commands.

Transfers and dispatches are blocking by default. With [`Completion::Deferred`] they return
once the command is queued, and the returned [`PendingWork`] or [`PendingRead`] is joined
with `wait()` or by [`ExecutionContext::drain`](crate::context::ExecutionContext::drain).

```
# use clpipe::{result::Result, buffer::{AccessMode, DeviceBuffer}, context::ExecutionContext};
# use clpipe::{device::{DeviceKind, DeviceRegistry}, future::Completion};
# fn main() -> Result<()> {
# let device = DeviceRegistry::builder().build()?.select_first(DeviceKind::Gpu)?;
let context = ExecutionContext::create(&device)?;
let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadWrite)?;
let upload = buffer.upload_from(&[1, 2, 3, 4], 0, Completion::Deferred)?;
context.drain()?;
upload.wait()?;
let mut output = [0i32; 4];
buffer.download_to(&mut output, 0, Completion::Blocking)?.wait()?;
assert_eq!(output, [1, 2, 3, 4]);
# Ok(())
# }
```
*/

use crate::{result::Result, scalar::Scalar};
use std::fmt::{self, Debug};

/// Whether a command blocks until it completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Completion {
    /// Returns after the command completes.
    #[default]
    Blocking,
    /// Returns after the command is queued.
    Deferred,
}

impl Completion {
    /// [`Blocking`](Completion::Blocking) if `blocking`.
    pub fn from_blocking(blocking: bool) -> Self {
        if blocking {
            Self::Blocking
        } else {
            Self::Deferred
        }
    }
}

type Deferred<T> = Box<dyn FnOnce() -> Result<T> + Send>;

/// Submitted work.
///
/// Dropping it without waiting does not cancel the work.
#[must_use = "errors are only reported by `wait`"]
pub struct PendingWork {
    deferred: Option<Deferred<()>>,
}

impl PendingWork {
    pub(crate) fn ready() -> Self {
        Self { deferred: None }
    }
    pub(crate) fn deferred(f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Self {
            deferred: Some(Box::new(f)),
        }
    }
    /// Whether the work completed when it was submitted.
    pub fn is_ready(&self) -> bool {
        self.deferred.is_none()
    }
    /// Blocks until the work completes.
    ///
    /// **errors**
    /// The error of the command, ie [`SubmissionFailed`](crate::error::Error::SubmissionFailed).
    pub fn wait(self) -> Result<()> {
        match self.deferred {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

impl Debug for PendingWork {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingWork")
            .field("ready", &self.is_ready())
            .finish()
    }
}

pub(crate) enum PendingBytes {
    Ready(Vec<u8>),
    Deferred(Deferred<Vec<u8>>),
}

impl PendingBytes {
    pub(crate) fn ready(bytes: Vec<u8>) -> Self {
        Self::Ready(bytes)
    }
    pub(crate) fn deferred(f: impl FnOnce() -> Result<Vec<u8>> + Send + 'static) -> Self {
        Self::Deferred(Box::new(f))
    }
    pub(crate) fn wait(self) -> Result<Vec<u8>> {
        match self {
            Self::Ready(bytes) => Ok(bytes),
            Self::Deferred(f) => f(),
        }
    }
}

/// A pending download into a host slice.
///
/// The host slice is written when the read is joined with [`wait`](PendingRead::wait).
#[must_use = "the host slice is only written by `wait`"]
pub struct PendingRead<'a, T> {
    host: &'a mut [T],
    bytes: PendingBytes,
}

impl<'a, T: Scalar> PendingRead<'a, T> {
    pub(crate) fn new(host: &'a mut [T], bytes: PendingBytes) -> Self {
        Self { host, bytes }
    }
    /// Whether the data was already downloaded.
    pub fn is_ready(&self) -> bool {
        matches!(self.bytes, PendingBytes::Ready(_))
    }
    /// Blocks until the download completes and copies it into the host slice.
    pub fn wait(self) -> Result<&'a mut [T]> {
        let bytes = self.bytes.wait()?;
        let host = self.host;
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut *host);
        let len = bytes.len().min(dst.len());
        dst[..len].copy_from_slice(&bytes[..len]);
        Ok(host)
    }
}

impl<T> Debug for PendingRead<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingRead")
            .field("len", &self.host.len())
            .finish()
    }
}
