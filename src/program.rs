/*!
Programs.

A [`ProgramUnit`] is device code compiled for the device of an [`ExecutionContext`]. A build
either succeeds or fails with a log, there is no transition back:

```
# use clpipe::{result::Result, context::ExecutionContext, device::{DeviceKind, DeviceRegistry}};
# use clpipe::program::{BuildStatus, ProgramUnit};
# fn main() -> Result<()> {
# let device = DeviceRegistry::builder().build()?.select_first(DeviceKind::Gpu)?;
let context = ExecutionContext::create(&device)?;
let program = ProgramUnit::compile(&context, "__kernel void f(__global int* x) { x[0] = y; }")?;
assert!(!program.is_built());
eprintln!("{}", program.build_log().unwrap_or_default());
assert!(ProgramUnit::build(&context, "__kernel void f() {}")?.is_built());
# Ok(())
# }
```
*/

use crate::{
    context::{ContextShared, ExecutionContext, Owned, Resource},
    device::RawProgram,
    error::Error,
    result::Result,
};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Build logs are truncated to this many bytes.
pub const MAX_BUILD_LOG_LEN: usize = 2048;

/// The terminal state of a build.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BuildStatus {
    /// The program can be used to resolve kernels.
    Built,
    /// The build failed.
    Failed {
        /// The build log, at most [`MAX_BUILD_LOG_LEN`] bytes.
        log: String,
    },
}

fn truncate_log(mut log: String) -> String {
    if log.len() > MAX_BUILD_LOG_LEN {
        let mut end = MAX_BUILD_LOG_LEN;
        while !log.is_char_boundary(end) {
            end -= 1;
        }
        log.truncate(end);
    }
    log
}

/// A compiled program.
pub struct ProgramUnit {
    status: BuildStatus,
    entry_points: Vec<String>,
    owned: Owned<RawProgram>,
}

impl ProgramUnit {
    /** Compiles `source` for the device of `context`.

    Returns the program in either terminal state, see [`status`](Self::status). Use
    [`build`](Self::build) to fail on build errors. */
    pub fn compile(context: &ExecutionContext, source: &str) -> Result<Self> {
        let shared = context.shared();
        let (raw, output) = shared.with_context(|raw| raw.compile(source))?;
        let (status, entry_points) = if output.built {
            if !output.log.is_empty() {
                log::debug!("build log:\n{}", output.log);
            }
            let entry_points = raw.entry_points();
            (BuildStatus::Built, entry_points)
        } else {
            log::debug!("build failed:\n{}", output.log);
            let log = truncate_log(output.log);
            (BuildStatus::Failed { log }, Vec::new())
        };
        let owned = Owned::new(shared, Resource::Program, raw);
        log::debug!("compiled program {}: {entry_points:?}", owned.id());
        Ok(Self {
            status,
            entry_points,
            owned,
        })
    }
    /** Compiles `source` for the device of `context`.

    **errors**
    - [`BuildFailed`](Error::BuildFailed) with the build log. The program is released. */
    pub fn build(context: &ExecutionContext, source: &str) -> Result<Self> {
        Self::compile(context, source)?.into_built()
    }
    /// Fails with [`BuildFailed`](Error::BuildFailed) unless the program was built.
    ///
    /// The failed program is released.
    pub fn into_built(self) -> Result<Self> {
        match &self.status {
            BuildStatus::Built => Ok(self),
            BuildStatus::Failed { log } => {
                let error = Error::BuildFailed { log: log.clone() };
                if let Err(e) = self.release() {
                    log::warn!("failed to release program: {e}");
                }
                Err(error)
            }
        }
    }
    /// The build status.
    pub fn status(&self) -> &BuildStatus {
        &self.status
    }
    /// Whether the build succeeded.
    pub fn is_built(&self) -> bool {
        self.status == BuildStatus::Built
    }
    /// The log of a failed build.
    pub fn build_log(&self) -> Option<&str> {
        match &self.status {
            BuildStatus::Built => None,
            BuildStatus::Failed { log } => Some(log),
        }
    }
    /// The names of the kernels in the program, empty if the build failed.
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }
    pub(crate) fn raw_built(&self) -> Result<&RawProgram> {
        let raw = self.owned.get()?;
        match self.status {
            BuildStatus::Built => Ok(raw),
            BuildStatus::Failed { .. } => Err(Error::ProgramNotBuilt),
        }
    }
    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        self.owned.context()
    }
    /// Releases the program.
    ///
    /// Kernels resolved from the program remain usable.
    pub fn release(mut self) -> Result<()> {
        log::debug!("releasing program {}", self.owned.id());
        self.owned.release()
    }
}

impl Debug for ProgramUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProgramUnit")
            .field("id", &self.owned.id())
            .field("built", &self.is_built())
            .field("entry_points", &self.entry_points)
            .finish()
    }
}
