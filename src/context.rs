/*!
Execution contexts.

An [`ExecutionContext`] binds a [`Device`] to a serial command queue. Programs, kernels and
buffers are created from a context and must be released before it. Every creation and release
is recorded in the [`LifecycleLog`] of the context:

```
# use clpipe::{result::Result, buffer::{AccessMode, DeviceBuffer}};
# use clpipe::{context::{ExecutionContext, Resource}, device::{DeviceKind, DeviceRegistry}};
# fn main() -> Result<()> {
# let device = DeviceRegistry::builder().build()?.select_first(DeviceKind::Gpu)?;
let context = ExecutionContext::create(&device)?;
let log = context.lifecycle();
let buffer = DeviceBuffer::allocate(&context, 16, AccessMode::ReadWrite)?;
buffer.release()?;
context.release()?;
let released: Vec<Resource> = log.released().into_iter().map(|(resource, _)| resource).collect();
assert_eq!(released, [Resource::Buffer, Resource::Queue, Resource::Context]);
# Ok(())
# }
```

Releasing consumes the handle, so a resource can not be released twice. A context that still
owns resources is not released: [`release`](ExecutionContext::release) fails with
[`ContextInUse`](crate::error::Error::ContextInUse) and the context stays live until its last
resource is released, so the release order always mirrors the creation order.
*/

use crate::{
    device::{Device, RawContext, RawQueue},
    error::Error,
    result::Result,
};
use derive_more::Display;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Resources owned by a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Resource {
    /// The context itself.
    #[display(fmt = "context")]
    Context,
    /// The command queue of the context.
    #[display(fmt = "command queue")]
    Queue,
    /// A [`ProgramUnit`](crate::program::ProgramUnit).
    #[display(fmt = "program")]
    Program,
    /// A [`KernelHandle`](crate::kernel::KernelHandle).
    #[display(fmt = "kernel")]
    Kernel,
    /// A [`DeviceBuffer`](crate::buffer::DeviceBuffer).
    #[display(fmt = "buffer")]
    Buffer,
}

/// A lifecycle transition.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Action {
    #[display(fmt = "created")]
    Created,
    #[display(fmt = "released")]
    Released,
}

/// An entry of a [`LifecycleLog`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display(fmt = "{} {} {}", resource, id, action)]
pub struct LifecycleEvent {
    resource: Resource,
    id: u64,
    action: Action,
}

impl LifecycleEvent {
    /// The resource.
    pub fn resource(&self) -> Resource {
        self.resource
    }
    /// Identifies the resource within its context, in creation order.
    pub fn id(&self) -> u64 {
        self.id
    }
    /// Created or released.
    pub fn action(&self) -> Action {
        self.action
    }
}

/// Records resource creation and release.
///
/// The log is shared, clones observe the same events. It outlives the context.
#[derive(Clone, Default)]
pub struct LifecycleLog {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl LifecycleLog {
    fn record(&self, resource: Resource, id: u64, action: Action) {
        log::trace!("{resource} {id} {action}");
        self.events.lock().push(LifecycleEvent {
            resource,
            id,
            action,
        });
    }
    /// All events, in order.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }
    fn filter(&self, action: Action) -> Vec<(Resource, u64)> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.action == action)
            .map(|event| (event.resource, event.id))
            .collect()
    }
    /// Created resources, in creation order.
    pub fn created(&self) -> Vec<(Resource, u64)> {
        self.filter(Action::Created)
    }
    /// Released resources, in release order.
    pub fn released(&self) -> Vec<(Resource, u64)> {
        self.filter(Action::Released)
    }
}

impl Debug for LifecycleLog {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.events.lock().iter()).finish()
    }
}

struct ContextState {
    queue: RawQueue,
    queue_id: u64,
    context: RawContext,
    context_id: u64,
}

#[derive(Default)]
struct Dependents {
    live: usize,
    detached: bool,
}

pub(crate) struct ContextShared {
    device: Device,
    state: RwLock<Option<ContextState>>,
    dependents: Mutex<Dependents>,
    log: LifecycleLog,
    next_id: AtomicU64,
    drain_timeout: Option<Duration>,
}

impl ContextShared {
    fn register(&self, resource: Resource) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.log.record(resource, id, Action::Created);
        id
    }
    fn unregister(&self, resource: Resource, id: u64) {
        self.log.record(resource, id, Action::Released);
    }
    fn acquire(&self, resource: Resource) -> u64 {
        let mut dependents = self.dependents.lock();
        dependents.live += 1;
        self.register(resource)
    }
    fn release_dependent(&self, resource: Resource, id: u64) {
        let mut dependents = self.dependents.lock();
        self.unregister(resource, id);
        dependents.live = dependents.live.saturating_sub(1);
        if dependents.live == 0 && dependents.detached {
            log::debug!("releasing detached context on {:?}", self.device);
            if let Err(e) = self.release_state() {
                log::warn!("failed to release detached context: {e}");
            }
        }
    }
    fn is_detached(&self) -> bool {
        self.dependents.lock().detached
    }
    pub(crate) fn device(&self) -> &Device {
        &self.device
    }
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.state.read().is_some() {
            Ok(())
        } else {
            Err(Error::ResourceReleased {
                resource: Resource::Context,
            })
        }
    }
    pub(crate) fn with_context<R>(&self, f: impl FnOnce(&RawContext) -> Result<R>) -> Result<R> {
        match self.state.read().as_ref() {
            Some(state) => f(&state.context),
            None => Err(Error::ResourceReleased {
                resource: Resource::Context,
            }),
        }
    }
    pub(crate) fn with_queue<R>(&self, f: impl FnOnce(&RawQueue) -> Result<R>) -> Result<R> {
        match self.state.read().as_ref() {
            Some(state) => f(&state.queue),
            None => Err(Error::ResourceReleased {
                resource: Resource::Context,
            }),
        }
    }
    /// Releases the queue and context, or detaches them while resources remain.
    fn release(&self) -> Result<()> {
        let mut dependents = self.dependents.lock();
        if dependents.live > 0 {
            dependents.detached = true;
            return Err(Error::ContextInUse {
                dependents: dependents.live,
            });
        }
        self.release_state()
    }
    fn release_state(&self) -> Result<()> {
        let state = self.state.write().take().ok_or(Error::ResourceReleased {
            resource: Resource::Context,
        })?;
        let ContextState {
            queue,
            queue_id,
            context,
            context_id,
        } = state;
        drop(queue);
        self.unregister(Resource::Queue, queue_id);
        drop(context);
        self.unregister(Resource::Context, context_id);
        Ok(())
    }
}

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating an [`ExecutionContext`].
    pub struct ContextBuilder {
        pub(super) device: Device,
        pub(super) drain_timeout: Option<Duration>,
        pub(super) log: LifecycleLog,
    }

    impl ContextBuilder {
        /// Bounds [`drain`](ExecutionContext::drain), defaults to no timeout.
        pub fn drain_timeout(mut self, timeout: Duration) -> Self {
            self.drain_timeout = Some(timeout);
            self
        }
        /// Records into `log` instead of a new log.
        pub fn lifecycle(mut self, log: LifecycleLog) -> Self {
            self.log = log;
            self
        }
        /// Creates the context and its queue.
        ///
        /// **errors**
        /// - [`ContextCreationFailed`](Error::ContextCreationFailed)
        /// - [`QueueCreationFailed`](Error::QueueCreationFailed), the context is released.
        pub fn build(self) -> Result<ExecutionContext> {
            let context = self.device.create_context()?;
            let shared = ContextShared {
                device: self.device,
                state: RwLock::new(None),
                dependents: Mutex::default(),
                log: self.log,
                next_id: AtomicU64::new(0),
                drain_timeout: self.drain_timeout,
            };
            let context_id = shared.register(Resource::Context);
            let queue = match context.create_queue() {
                Ok(queue) => queue,
                Err(e) => {
                    drop(context);
                    shared.unregister(Resource::Context, context_id);
                    return Err(e);
                }
            };
            let queue_id = shared.register(Resource::Queue);
            *shared.state.write() = Some(ContextState {
                queue,
                queue_id,
                context,
                context_id,
            });
            log::debug!("created context {context_id} on {:?}", shared.device);
            Ok(ExecutionContext {
                shared: Arc::new(shared),
            })
        }
    }
}
use builder::ContextBuilder;

/// A device and its command queue.
pub struct ExecutionContext {
    shared: Arc<ContextShared>,
}

impl ExecutionContext {
    /// Creates a context and its queue on `device`.
    ///
    /// See [`ContextBuilder::build`].
    pub fn create(device: &Device) -> Result<Self> {
        Self::builder(device).build()
    }
    /// A builder for creating a context on `device`.
    pub fn builder(device: &Device) -> ContextBuilder {
        ContextBuilder {
            device: device.clone(),
            drain_timeout: None,
            log: LifecycleLog::default(),
        }
    }
    /// The device.
    pub fn device(&self) -> &Device {
        &self.shared.device
    }
    /// The drain timeout.
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.shared.drain_timeout
    }
    /// The lifecycle log.
    pub fn lifecycle(&self) -> LifecycleLog {
        self.shared.log.clone()
    }
    /** Blocks until all submitted commands have completed.

    **errors**
    - [`DeviceHang`](Error::DeviceHang) if a drain timeout is configured and exceeded.
    The device work is not aborted. */
    pub fn drain(&self) -> Result<()> {
        log::trace!("drain");
        self.shared
            .with_queue(|queue| queue.finish(self.shared.drain_timeout))
    }
    /** Releases the queue, then the context.

    Commands already submitted still run to completion, see [`drain`](Self::drain).

    **errors**
    - [`ContextInUse`](Error::ContextInUse) if programs, kernels or buffers of the context have
      not been released. The context stays live and is released with its last resource. */
    pub fn release(self) -> Result<()> {
        self.shared.release()?;
        log::debug!("released context on {:?}", self.shared.device);
        Ok(())
    }
    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.shared.ensure_live().is_ok() && !self.shared.is_detached() {
            log::warn!("context dropped without release");
            if let Err(e) = self.shared.release() {
                log::warn!("context outlives its handle: {e}");
            }
        }
    }
}

impl Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("device", &self.shared.device)
            .field("released", &self.shared.ensure_live().is_err())
            .finish()
    }
}

/// A resource owned by a context.
pub(crate) struct Owned<T> {
    context: Arc<ContextShared>,
    resource: Resource,
    id: u64,
    raw: Option<T>,
}

impl<T> Owned<T> {
    pub(crate) fn new(context: &Arc<ContextShared>, resource: Resource, raw: T) -> Self {
        let id = context.acquire(resource);
        Self {
            context: context.clone(),
            resource,
            id,
            raw: Some(raw),
        }
    }
    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        &self.context
    }
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
    /// The raw resource, if the context is live.
    pub(crate) fn get(&self) -> Result<&T> {
        self.context.ensure_live()?;
        self.raw.as_ref().ok_or(Error::ResourceReleased {
            resource: self.resource,
        })
    }
    pub(crate) fn release(&mut self) -> Result<()> {
        let raw = self.raw.take().ok_or(Error::ResourceReleased {
            resource: self.resource,
        })?;
        drop(raw);
        self.context.release_dependent(self.resource, self.id);
        Ok(())
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        if self.raw.is_some() {
            log::warn!("{} {} dropped without release", self.resource, self.id);
            self.release().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceKind, DeviceRegistry, SimDevice},
        error::codes,
        kernel::KernelHandle,
        kernels::{CUBE_ENTRY, CUBE_SOURCE},
        program::ProgramUnit,
    };

    fn device(sim: SimDevice) -> Device {
        DeviceRegistry::builder()
            .sim_devices([sim])
            .build()
            .unwrap()
            .select_first(DeviceKind::All)
            .unwrap()
    }

    #[test]
    fn release_order() {
        let context = ExecutionContext::create(&device(SimDevice::gpu())).unwrap();
        let log = context.lifecycle();
        context.drain().unwrap();
        context.release().unwrap();
        assert_eq!(
            log.created(),
            [(Resource::Context, 0), (Resource::Queue, 1)]
        );
        assert_eq!(
            log.released(),
            [(Resource::Queue, 1), (Resource::Context, 0)]
        );
    }

    #[test]
    fn queue_failure_releases_the_context() {
        let log = LifecycleLog::default();
        let error = ExecutionContext::builder(&device(
            SimDevice::gpu().with_queue_failure(codes::CL_OUT_OF_HOST_MEMORY),
        ))
        .lifecycle(log.clone())
        .build()
        .unwrap_err();
        assert_eq!(
            error,
            Error::QueueCreationFailed {
                code: codes::CL_OUT_OF_HOST_MEMORY
            }
        );
        assert_eq!(log.released(), [(Resource::Context, 0)]);
    }

    #[test]
    fn context_failure() {
        let error = ExecutionContext::create(&device(
            SimDevice::gpu().with_context_failure(codes::CL_DEVICE_NOT_AVAILABLE),
        ))
        .unwrap_err();
        assert_eq!(
            error,
            Error::ContextCreationFailed {
                code: codes::CL_DEVICE_NOT_AVAILABLE
            }
        );
    }

    #[test]
    fn drop_releases() {
        let context = ExecutionContext::create(&device(SimDevice::cpu())).unwrap();
        let log = context.lifecycle();
        drop(context);
        assert_eq!(log.released().len(), 2);
    }

    #[test]
    fn release_waits_for_dependents() {
        let context = ExecutionContext::create(&device(SimDevice::gpu())).unwrap();
        let log = context.lifecycle();
        let program = ProgramUnit::build(&context, CUBE_SOURCE).unwrap();
        let kernel = KernelHandle::resolve(&program, CUBE_ENTRY).unwrap();
        assert_eq!(
            context.release().unwrap_err(),
            Error::ContextInUse { dependents: 2 }
        );
        assert!(log.released().is_empty());
        kernel.release().unwrap();
        assert_eq!(log.released(), [(Resource::Kernel, 3)]);
        program.release().unwrap();
        assert_eq!(
            log.released(),
            [
                (Resource::Kernel, 3),
                (Resource::Program, 2),
                (Resource::Queue, 1),
                (Resource::Context, 0)
            ]
        );
    }

    #[test]
    fn dropped_context_is_released_with_its_last_dependent() {
        let context = ExecutionContext::create(&device(SimDevice::cpu())).unwrap();
        let log = context.lifecycle();
        let program = ProgramUnit::build(&context, CUBE_SOURCE).unwrap();
        drop(context);
        assert!(log.released().is_empty());
        drop(program);
        assert_eq!(log.released().len(), 3);
    }
}
