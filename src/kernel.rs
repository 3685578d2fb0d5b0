/*!
Kernels.

A [`KernelHandle`] is an entry point resolved from a built [`ProgramUnit`]. Arguments are bound
by position and checked against the declared parameters of the entry point:

```
# use clpipe::{result::Result, buffer::{AccessMode, DeviceBuffer}, context::ExecutionContext};
# use clpipe::{device::{DeviceKind, DeviceRegistry}, kernel::{KernelArg, KernelHandle}};
# use clpipe::{kernels::CUBE_SOURCE, program::ProgramUnit};
# fn main() -> Result<()> {
# let device = DeviceRegistry::builder().build()?.select_first(DeviceKind::Gpu)?;
let context = ExecutionContext::create(&device)?;
let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
let mut kernel = KernelHandle::resolve(&program, "cube")?;
assert_eq!(kernel.arity(), 3);
let input = DeviceBuffer::allocate_for::<i32>(&context, 8, AccessMode::ReadOnly)?;
kernel.bind_argument(0, KernelArg::Buffer(&input))?;
kernel.bind_argument(2, KernelArg::scalar(8u32))?;
// the third parameter is a scalar
assert!(kernel.bind_argument(2, KernelArg::Buffer(&input)).is_err());
# Ok(())
# }
```
*/

use crate::{
    buffer::DeviceBuffer,
    context::{ContextShared, Owned, Resource},
    device::{Device, RawKernel},
    error::{codes::*, Error, Stage},
    program::ProgramUnit,
    result::Result,
    scalar::{Scalar, ScalarElem, ScalarType},
};
use std::{
    fmt::{self, Debug, Display},
    sync::Arc,
};

/// The kind of a kernel parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// A `__global` pointer.
    Buffer {
        /// The element type, if known.
        elem: Option<ScalarType>,
    },
    /// A scalar passed by value.
    Scalar(ScalarType),
    /// The platform did not report the parameter.
    Unknown,
}

impl Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Buffer { elem: Some(elem) } => write!(f, "__global {}*", elem.cl_name()),
            Self::Buffer { elem: None } => f.write_str("__global buffer"),
            Self::Scalar(ty) => f.write_str(ty.cl_name()),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A declared kernel parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Param {
    pub(crate) name: String,
    pub(crate) kind: ParamKind,
}

impl Param {
    /// The name of the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The kind of the parameter.
    pub fn kind(&self) -> ParamKind {
        self.kind
    }
}

impl Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// A kernel argument.
#[derive(Clone, Copy, Debug)]
pub enum KernelArg<'a> {
    /// A buffer, bound to a `__global` pointer.
    Buffer(&'a DeviceBuffer),
    /// A scalar of an explicit type.
    Scalar(ScalarElem),
}

impl KernelArg<'_> {
    /// A scalar argument.
    pub fn scalar<T: Scalar>(x: T) -> Self {
        Self::Scalar(x.into())
    }
    fn describe(&self) -> String {
        match self {
            Self::Buffer(buffer) if buffer.is_empty() => "empty buffer".into(),
            Self::Buffer(_) => "buffer".into(),
            Self::Scalar(x) => x.scalar_type().cl_name().into(),
        }
    }
}

impl<'a> From<&'a DeviceBuffer> for KernelArg<'a> {
    fn from(buffer: &'a DeviceBuffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<ScalarElem> for KernelArg<'_> {
    fn from(x: ScalarElem) -> Self {
        Self::Scalar(x)
    }
}

/// A kernel entry point and its argument slots.
pub struct KernelHandle {
    name: String,
    params: Arc<[Param]>,
    bound: Vec<bool>,
    owned: Owned<RawKernel>,
}

impl KernelHandle {
    /** Resolves the entry point `entry` of `program`.

    **errors**
    - [`ProgramNotBuilt`](Error::ProgramNotBuilt) if the program failed to build.
    - [`EntryNotFound`](Error::EntryNotFound) if the program has no such entry point. */
    pub fn resolve(program: &ProgramUnit, entry: &str) -> Result<Self> {
        let raw_program = program.raw_built()?;
        if !program.entry_points().iter().any(|name| name == entry) {
            return Err(Error::EntryNotFound {
                name: entry.to_string(),
            });
        }
        let raw = raw_program.create_kernel(entry)?;
        let params: Arc<[Param]> = raw.params().into();
        let owned = Owned::new(program.context(), Resource::Kernel, raw);
        log::debug!("resolved kernel {} `{entry}`", owned.id());
        Ok(Self {
            name: entry.to_string(),
            bound: vec![false; params.len()],
            params,
            owned,
        })
    }
    /// The name of the entry point.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of parameters.
    pub fn arity(&self) -> usize {
        self.params.len()
    }
    /// The declared parameters.
    pub fn parameters(&self) -> &[Param] {
        &self.params
    }
    fn mismatch(&self, index: usize, arg: &KernelArg) -> Error {
        Error::ArgumentTypeMismatch {
            kernel: self.name.clone(),
            index,
            expected: self.params[index].kind.to_string(),
            found: arg.describe(),
        }
    }
    /** Binds `arg` to parameter `index`.

    Rebinding overwrites the previous argument.

    **errors**
    - [`IndexOutOfRange`](Error::IndexOutOfRange) if `index` is not less than the arity.
    - [`ArgumentTypeMismatch`](Error::ArgumentTypeMismatch) if a buffer is bound to a scalar
    parameter or vice versa, a scalar has a different width than the parameter, or the
    buffer is empty. */
    pub fn bind_argument<'a>(&mut self, index: usize, arg: impl Into<KernelArg<'a>>) -> Result<()> {
        let arg = arg.into();
        let raw = self.owned.get()?;
        let param = self.params.get(index).ok_or_else(|| Error::IndexOutOfRange {
            kernel: self.name.clone(),
            index,
            arity: self.params.len(),
        })?;
        match (param.kind, arg) {
            (ParamKind::Buffer { .. } | ParamKind::Unknown, KernelArg::Buffer(buffer)) => {
                if buffer.is_empty() {
                    return Err(self.mismatch(index, &arg));
                }
                if !Arc::ptr_eq(self.owned.context(), buffer.context()) {
                    return Err(Error::SubmissionFailed {
                        stage: Stage::Arguments,
                        code: CL_INVALID_CONTEXT,
                        message: format!(
                            "buffer bound to argument {index} of `{}` belongs to another context",
                            self.name
                        ),
                    });
                }
                raw.set_buffer(index, buffer.raw()?)?;
            }
            (ParamKind::Scalar(ty), KernelArg::Scalar(x)) if ty.size() == x.scalar_type().size() => {
                raw.set_scalar(index, x)?;
            }
            (ParamKind::Unknown, KernelArg::Scalar(x)) => {
                raw.set_scalar(index, x)?;
            }
            _ => return Err(self.mismatch(index, &arg)),
        }
        log::trace!("bound argument {index} of `{}`: {}", self.name, arg.describe());
        self.bound[index] = true;
        Ok(())
    }
    /// The first parameter without an argument.
    pub(crate) fn first_unbound(&self) -> Option<usize> {
        self.bound.iter().position(|bound| !bound)
    }
    /** The work-group size suggested by the platform for this kernel on `device`.

    This is advisory, dispatches use the device default partitioning unless a local size is
    given explicitly. */
    pub fn query_preferred_local_size(&self, device: &Device) -> Result<usize> {
        let raw = self.owned.get()?;
        if device != self.owned.context().device() {
            return Err(Error::SubmissionFailed {
                stage: Stage::Kernel,
                code: CL_INVALID_DEVICE,
                message: format!("{device:?} is not the device of the kernel's context"),
            });
        }
        raw.preferred_work_group_size(device.info())
    }
    pub(crate) fn raw(&self) -> Result<&RawKernel> {
        self.owned.get()
    }
    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        self.owned.context()
    }
    /// Releases the kernel.
    pub fn release(mut self) -> Result<()> {
        log::debug!("releasing kernel {} `{}`", self.owned.id(), self.name);
        self.owned.release()
    }
}

impl Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("id", &self.owned.id())
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}
