/*!
Runs a data-parallel kernel on an accelerator and verifies the result against the host.

The [`pipeline`] drives the stages, each of which is also usable on its own:
[`device`] discovery, the [`context`] and its queue, [`program`] builds, [`kernel`] argument
binding, [`buffer`] transfers, [`dispatch`] and [`verify`]. Every failure is an
[`Error`](error::Error) that knows its [`Stage`](error::Stage).
*/
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub use clpipe_core;

#[doc(inline)]
pub use clpipe_core::scalar;

/// Results.
pub mod result {
    /// A [`Result`](std::result::Result) of [`Error`](crate::error::Error).
    pub type Result<T, E = crate::error::Error> = std::result::Result<T, E>;
}

pub mod buffer;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod kernel;
pub mod kernels;
pub mod pipeline;
pub mod program;
pub mod verify;
