/*!
Errors.

Every failure in the pipeline is an [`Error`]. Each variant knows the [`Stage`] it
belongs to, and failures reported by the platform carry the raw platform code
(see [`codes`]), so that a caller can report precisely which stage failed:

```
# use clpipe::error::{Error, Stage};
let error = Error::QueueCreationFailed { code: -6 };
assert_eq!(error.stage(), Stage::Queue);
assert_eq!(error.code(), Some(-6));
```
*/

use crate::{
    buffer::{AccessMode, Direction},
    context::Resource,
    device::DeviceKind,
};
use derive_more::Display;
use std::time::Duration;

/// Platform status codes.
///
/// The values are the OpenCL status codes. The simulated engine reports the
/// same codes an OpenCL runtime would for the equivalent failure.
pub mod codes {
    #![allow(missing_docs)]

    pub const CL_DEVICE_NOT_FOUND: i32 = -1;
    pub const CL_DEVICE_NOT_AVAILABLE: i32 = -2;
    pub const CL_MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
    pub const CL_OUT_OF_RESOURCES: i32 = -5;
    pub const CL_OUT_OF_HOST_MEMORY: i32 = -6;
    pub const CL_BUILD_PROGRAM_FAILURE: i32 = -11;
    pub const CL_INVALID_VALUE: i32 = -30;
    pub const CL_INVALID_DEVICE: i32 = -33;
    pub const CL_INVALID_CONTEXT: i32 = -34;
    pub const CL_INVALID_COMMAND_QUEUE: i32 = -36;
    pub const CL_INVALID_MEM_OBJECT: i32 = -38;
    pub const CL_INVALID_KERNEL_NAME: i32 = -46;
    pub const CL_INVALID_BUFFER_SIZE: i32 = -61;
    pub const CL_PLATFORM_NOT_FOUND_KHR: i32 = -1001;
}

/// The pipeline stage an [`Error`] occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Stage {
    /// Device enumeration or capability queries.
    #[display(fmt = "device discovery")]
    Discovery,
    /// Creating the compute context.
    #[display(fmt = "context creation")]
    Context,
    /// Creating the command queue.
    #[display(fmt = "queue creation")]
    Queue,
    /// Building the program.
    #[display(fmt = "program build")]
    Build,
    /// Resolving a kernel from a program.
    #[display(fmt = "kernel creation")]
    Kernel,
    /// Binding kernel arguments.
    #[display(fmt = "kernel arguments")]
    Arguments,
    /// Allocating device memory.
    #[display(fmt = "buffer allocation")]
    Allocation,
    /// Host to device transfers.
    #[display(fmt = "upload")]
    Upload,
    /// Computing the work grid and submitting the kernel.
    #[display(fmt = "dispatch")]
    Dispatch,
    /// Waiting for submitted work.
    #[display(fmt = "drain")]
    Drain,
    /// Device to host transfers.
    #[display(fmt = "download")]
    Download,
    /// Comparing results against the reference.
    #[display(fmt = "verification")]
    Verify,
    /// Releasing resources.
    #[display(fmt = "release")]
    Release,
}

impl From<Direction> for Stage {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Upload => Self::Upload,
            Direction::Download => Self::Download,
        }
    }
}

/// Pipeline errors.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// No device matched the requested kind.
    #[error("no {kind} device found")]
    NoDeviceFound {
        /// The requested kind.
        kind: DeviceKind,
    },
    /// The platform failed to enumerate or describe devices.
    #[error("device query failed (platform code {code})")]
    DeviceQueryFailed {
        /// Platform code.
        code: i32,
    },
    /// The compute context could not be created.
    #[error("failed to create a compute context (platform code {code})")]
    ContextCreationFailed {
        /// Platform code.
        code: i32,
    },
    /// The command queue could not be created.
    #[error("failed to create a command queue (platform code {code})")]
    QueueCreationFailed {
        /// Platform code.
        code: i32,
    },
    /// The program failed to build.
    #[error("failed to build program executable\n{log}")]
    BuildFailed {
        /// The build log, truncated to [`MAX_BUILD_LOG_LEN`](crate::program::MAX_BUILD_LOG_LEN) bytes.
        log: String,
    },
    /// The program has no entry point with this name.
    #[error("entry point `{name}` not found in program")]
    EntryNotFound {
        /// The requested name.
        name: String,
    },
    /// A kernel was requested from a program that failed to build.
    #[error("program was not built")]
    ProgramNotBuilt,
    /// The argument does not match the declared parameter.
    #[error("argument {index} of `{kernel}` expects {expected}, found {found}")]
    ArgumentTypeMismatch {
        /// Kernel name.
        kernel: String,
        /// Argument index.
        index: usize,
        /// Declared parameter.
        expected: String,
        /// The bound value.
        found: String,
    },
    /// The argument index exceeds the arity of the kernel.
    #[error("argument index {index} is out of range 0..{arity} for `{kernel}`")]
    IndexOutOfRange {
        /// Kernel name.
        kernel: String,
        /// Argument index.
        index: usize,
        /// Number of parameters.
        arity: usize,
    },
    /// A kernel was submitted with an unbound argument.
    #[error("argument {index} of `{kernel}` is not bound")]
    UnboundArgument {
        /// Kernel name.
        kernel: String,
        /// Argument index.
        index: usize,
    },
    /// The device could not satisfy an allocation.
    #[error("failed to allocate {bytes} bytes of device memory (platform code {code})")]
    AllocationFailed {
        /// Requested size.
        bytes: usize,
        /// Platform code.
        code: i32,
    },
    /// The access mode of the buffer forbids the transfer.
    #[error("{access} buffer can not be used for {direction}")]
    AccessModeViolation {
        /// Access mode of the buffer.
        access: AccessMode,
        /// Requested transfer.
        direction: Direction,
    },
    /// The transfer does not fit in the buffer.
    #[error("{direction} of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    TransferOutOfBounds {
        /// Requested transfer.
        direction: Direction,
        /// Byte offset.
        offset: usize,
        /// Bytes transferred.
        len: usize,
        /// Size of the buffer.
        size: usize,
    },
    /// The work grid is malformed or exceeds device limits.
    #[error("invalid work grid: {reason}")]
    InvalidGridConfiguration {
        /// Description of the violated constraint.
        reason: String,
    },
    /// The device rejected or failed a submitted command.
    #[error("{stage} failed (platform code {code}): {message}")]
    SubmissionFailed {
        /// The command that failed.
        stage: Stage,
        /// Platform code.
        code: i32,
        /// Diagnostic.
        message: String,
    },
    /// Submitted work did not complete within the drain timeout.
    #[error("device did not complete submitted work within {timeout:?}")]
    DeviceHang {
        /// The configured timeout.
        timeout: Duration,
    },
    /// Reference and observed sequences differ in length.
    #[error("reference has {reference} elements, observed has {observed}")]
    LengthMismatch {
        /// Reference length.
        reference: usize,
        /// Observed length.
        observed: usize,
    },
    /// The resource, or the context that owns it, was released.
    #[error("{resource} was already released")]
    ResourceReleased {
        /// The released resource.
        resource: Resource,
    },
    /// The context still owns resources that have not been released.
    #[error("context still owns {dependents} unreleased resource(s)")]
    ContextInUse {
        /// The number of live programs, kernels and buffers.
        dependents: usize,
    },
}

impl Error {
    /// The stage the error occurred in.
    pub fn stage(&self) -> Stage {
        use Error::*;
        match self {
            NoDeviceFound { .. } | DeviceQueryFailed { .. } => Stage::Discovery,
            ContextCreationFailed { .. } => Stage::Context,
            QueueCreationFailed { .. } => Stage::Queue,
            BuildFailed { .. } => Stage::Build,
            EntryNotFound { .. } | ProgramNotBuilt => Stage::Kernel,
            ArgumentTypeMismatch { .. } | IndexOutOfRange { .. } => Stage::Arguments,
            UnboundArgument { .. } | InvalidGridConfiguration { .. } => Stage::Dispatch,
            AllocationFailed { .. } => Stage::Allocation,
            AccessModeViolation { direction, .. } | TransferOutOfBounds { direction, .. } => {
                (*direction).into()
            }
            SubmissionFailed { stage, .. } => *stage,
            DeviceHang { .. } => Stage::Drain,
            LengthMismatch { .. } => Stage::Verify,
            ResourceReleased { .. } | ContextInUse { .. } => Stage::Release,
        }
    }
    /// The platform code, if the error came from the platform.
    pub fn code(&self) -> Option<i32> {
        use Error::*;
        match self {
            DeviceQueryFailed { code }
            | ContextCreationFailed { code }
            | QueueCreationFailed { code }
            | AllocationFailed { code, .. }
            | SubmissionFailed { code, .. } => Some(*code),
            BuildFailed { .. } => Some(codes::CL_BUILD_PROGRAM_FAILURE),
            _ => None,
        }
    }
    /// The build log of a [`BuildFailed`](Error::BuildFailed) error.
    pub fn build_log(&self) -> Option<&str> {
        if let Self::BuildFailed { log } = self {
            Some(log)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_errors_take_the_stage_of_their_direction() {
        let error = Error::AccessModeViolation {
            access: AccessMode::ReadOnly,
            direction: Direction::Download,
        };
        assert_eq!(error.stage(), Stage::Download);
        assert_eq!(error.to_string(), "read-only buffer can not be used for download");
        let error = Error::TransferOutOfBounds {
            direction: Direction::Upload,
            offset: 4,
            len: 8,
            size: 8,
        };
        assert_eq!(error.stage(), Stage::Upload);
    }

    #[test]
    fn build_failures_carry_their_log() {
        let error = Error::BuildFailed {
            log: "cube:1:1: error: expected '__kernel'".into(),
        };
        assert_eq!(error.stage(), Stage::Build);
        assert_eq!(error.code(), Some(codes::CL_BUILD_PROGRAM_FAILURE));
        assert!(error.build_log().unwrap().contains("expected"));
        assert!(error.to_string().contains("expected '__kernel'"));
    }
}
