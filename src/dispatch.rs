/*!
Dispatching kernels.

A [`WorkGrid`] is the global size of a dispatch, and optionally the size of its work-groups.
Without a local size the device partitions the grid:

```
# use clpipe::{result::Result, device::{DeviceKind, DeviceRegistry}, dispatch::{Dispatcher, WorkGrid}};
# fn main() -> Result<()> {
# let device = DeviceRegistry::builder().build()?.select_first(DeviceKind::Gpu)?;
let grid = Dispatcher::compute_grid(128, &device)?;
assert_eq!(grid.global_size(), [128]);
assert_eq!(grid.local_size(), None);
assert!(WorkGrid::new(&[10], Some(&[3])).is_err());
let grid = Dispatcher::compute_grid_with_local(12, 4, &device)?;
assert_eq!(grid.local_size(), Some(&[4][..]));
# Ok(())
# }
```
*/

use crate::{
    context::ExecutionContext,
    device::Device,
    error::{codes::CL_INVALID_CONTEXT, Error, Stage},
    future::{Completion, PendingWork},
    kernel::KernelHandle,
    result::Result,
};
use std::{
    fmt::{self, Display},
    sync::Arc,
};

fn invalid(reason: String) -> Error {
    Error::InvalidGridConfiguration { reason }
}

/// The shape of a dispatch.
///
/// Unused dimensions have size 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkGrid {
    dims: usize,
    global: [usize; 3],
    local: Option<[usize; 3]>,
}

impl WorkGrid {
    /** A grid of 1 to 3 dimensions.

    **errors**
    - [`InvalidGridConfiguration`](Error::InvalidGridConfiguration) if there are no dimensions
    or more than 3, a size is zero, `local` has a different number of dimensions than
    `global`, `global` is not divisible by `local`, or the number of work-items overflows
    `usize`. */
    pub fn new(global: &[usize], local: Option<&[usize]>) -> Result<Self> {
        let dims = global.len();
        if !(1..=3).contains(&dims) {
            return Err(invalid(format!(
                "expected 1 to 3 dimensions, found {dims}"
            )));
        }
        let mut global_size = [1; 3];
        for (dim, size) in global.iter().copied().enumerate() {
            if size == 0 {
                return Err(invalid(format!("global size is zero in dimension {dim}")));
            }
            global_size[dim] = size;
        }
        if global_size
            .iter()
            .try_fold(1usize, |total, size| total.checked_mul(*size))
            .is_none()
        {
            return Err(invalid(format!(
                "global size {global:?} exceeds {} work-items",
                usize::MAX
            )));
        }
        let local = match local {
            Some(local) => {
                if local.len() != dims {
                    return Err(invalid(format!(
                        "local size has {} dimensions, global size has {dims}",
                        local.len()
                    )));
                }
                let mut local_size = [1; 3];
                for (dim, (global, local)) in global.iter().zip(local).enumerate() {
                    if *local == 0 {
                        return Err(invalid(format!("local size is zero in dimension {dim}")));
                    }
                    if global % local != 0 {
                        return Err(invalid(format!(
                            "global size {global} is not divisible by local size {local} in dimension {dim}"
                        )));
                    }
                    local_size[dim] = *local;
                }
                Some(local_size)
            }
            None => None,
        };
        Ok(Self {
            dims,
            global: global_size,
            local,
        })
    }
    /// The number of dimensions.
    pub fn dims(&self) -> usize {
        self.dims
    }
    /// The global size, padded to 3 dimensions.
    pub fn global(&self) -> &[usize; 3] {
        &self.global
    }
    /// The local size, padded to 3 dimensions.
    pub fn local(&self) -> Option<&[usize; 3]> {
        self.local.as_ref()
    }
    /// The global size of each dimension.
    pub fn global_size(&self) -> &[usize] {
        &self.global[..self.dims]
    }
    /// The local size of each dimension.
    pub fn local_size(&self) -> Option<&[usize]> {
        self.local.as_ref().map(|local| &local[..self.dims])
    }
    /// The total number of work-items.
    ///
    /// Grids whose work-item count overflows are rejected by [`new`](Self::new).
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
    /** Checks the grid against the limits of `device`.

    **errors**
    - [`InvalidGridConfiguration`](Error::InvalidGridConfiguration) if the grid has more
    dimensions than the device supports, or the local size exceeds the maximum work-group size
    or the per dimension maximum. */
    pub fn validate_for(&self, device: &Device) -> Result<()> {
        let info = device.info();
        let max_dims = info.max_work_item_dimensions() as usize;
        if self.dims > max_dims {
            return Err(invalid(format!(
                "{} dimensions exceed the device maximum of {max_dims}",
                self.dims
            )));
        }
        if let Some(local) = self.local_size() {
            let group_size: usize = local.iter().product();
            let max_group_size = info.max_work_group_size();
            if group_size > max_group_size {
                return Err(invalid(format!(
                    "work-group size {group_size} exceeds the device maximum of {max_group_size}"
                )));
            }
            for (dim, (local, max)) in local.iter().zip(info.max_work_item_sizes()).enumerate() {
                if local > max {
                    return Err(invalid(format!(
                        "local size {local} exceeds the device maximum of {max} in dimension {dim}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Display for WorkGrid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "global {:?}", self.global_size())?;
        match self.local_size() {
            Some(local) => write!(f, " local {local:?}"),
            None => write!(f, " local default"),
        }
    }
}

/// Computes work grids and submits kernels.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dispatcher;

impl Dispatcher {
    /// A 1 dimensional grid of `total_elements` work-items, partitioned by the device.
    pub fn compute_grid(total_elements: usize, device: &Device) -> Result<WorkGrid> {
        let grid = WorkGrid::new(&[total_elements], None)?;
        grid.validate_for(device)?;
        Ok(grid)
    }
    /// A 1 dimensional grid of `total_elements` work-items in groups of `local_size`.
    ///
    /// The local size is never clamped, see [`WorkGrid::validate_for`].
    pub fn compute_grid_with_local(
        total_elements: usize,
        local_size: usize,
        device: &Device,
    ) -> Result<WorkGrid> {
        let grid = WorkGrid::new(&[total_elements], Some(&[local_size]))?;
        grid.validate_for(device)?;
        Ok(grid)
    }
    /** Submits `kernel` over `grid` to the queue of `context`.

    With [`Completion::Blocking`] returns after the kernel has executed.

    **errors**
    - [`UnboundArgument`](Error::UnboundArgument) if a parameter has no argument, nothing is
    submitted.
    - [`InvalidGridConfiguration`](Error::InvalidGridConfiguration) if the grid exceeds the
    device limits.
    - [`SubmissionFailed`](Error::SubmissionFailed) if the platform rejects the kernel or it
    faults. */
    pub fn submit(
        context: &ExecutionContext,
        kernel: &KernelHandle,
        grid: &WorkGrid,
        completion: Completion,
    ) -> Result<PendingWork> {
        let raw = kernel.raw()?;
        if !Arc::ptr_eq(context.shared(), kernel.context()) {
            return Err(Error::SubmissionFailed {
                stage: Stage::Dispatch,
                code: CL_INVALID_CONTEXT,
                message: format!("`{}` belongs to another context", kernel.name()),
            });
        }
        if let Some(index) = kernel.first_unbound() {
            return Err(Error::UnboundArgument {
                kernel: kernel.name().to_string(),
                index,
            });
        }
        grid.validate_for(context.device())?;
        log::debug!("dispatch `{}` {grid}", kernel.name());
        let pending = context
            .shared()
            .with_queue(|queue| queue.dispatch(raw, grid))?;
        match completion {
            Completion::Blocking => {
                pending.wait()?;
                Ok(PendingWork::ready())
            }
            Completion::Deferred => Ok(pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DeviceRegistry, SimDevice};

    fn device() -> Device {
        DeviceRegistry::builder()
            .sim_devices([SimDevice::gpu()
                .with_max_work_group_size(256)
                .with_max_work_item_sizes([256, 256, 4])])
            .build()
            .unwrap()
            .select_first(DeviceKind::Gpu)
            .unwrap()
    }

    #[test]
    fn divisibility() {
        assert!(matches!(
            WorkGrid::new(&[10], Some(&[3])),
            Err(Error::InvalidGridConfiguration { .. })
        ));
        let grid = WorkGrid::new(&[12], Some(&[4])).unwrap();
        assert_eq!(grid.global(), &[12, 1, 1]);
        assert_eq!(grid.local(), Some(&[4, 1, 1]));
        assert_eq!(grid.to_string(), "global [12] local [4]");
    }

    #[test]
    fn shape() {
        for (global, local) in [
            (&[][..], None),
            (&[1, 1, 1, 1][..], None),
            (&[0][..], None),
            (&[8][..], Some(&[0][..])),
            (&[8, 8][..], Some(&[8][..])),
            (&[usize::MAX, 2][..], None),
            (&[usize::MAX / 2, 1, 3][..], None),
        ] {
            assert!(WorkGrid::new(global, local).is_err(), "{global:?} {local:?}");
        }
        let grid = WorkGrid::new(&[4, 6], None).unwrap();
        assert_eq!(grid.dims(), 2);
        assert_eq!(grid.work_items(), 24);
    }

    #[test]
    fn device_limits() {
        let device = device();
        assert!(Dispatcher::compute_grid(1 << 20, &device).is_ok());
        assert!(Dispatcher::compute_grid_with_local(1024, 256, &device).is_ok());
        assert!(matches!(
            Dispatcher::compute_grid_with_local(1024, 512, &device),
            Err(Error::InvalidGridConfiguration { .. })
        ));
        let grid = WorkGrid::new(&[8, 8, 8], Some(&[1, 1, 8])).unwrap();
        assert!(grid.validate_for(&device).is_err());
        let grid = WorkGrid::new(&[8, 8, 8], Some(&[2, 2, 4])).unwrap();
        assert!(grid.validate_for(&device).is_ok());
    }
}
