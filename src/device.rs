/*!

A [`DeviceRegistry`](crate::device::DeviceRegistry) enumerates the devices of a [`Backend`](crate::device::Backend).
Devices are enumerated once, when the registry is built, and are never mutated afterwards.

Selecting a device and printing its capabilities:
```
# use clpipe::{result::Result, device::{DeviceKind, DeviceRegistry}};
# fn main() -> Result<()> {
let registry = DeviceRegistry::builder().build()?;
let device = registry.select_first(DeviceKind::Gpu)?;
println!("{}", registry.describe(&device));
# Ok(())
# }
```

# Backends
- [`Backend::Sim`]: a simulated accelerator that is always available. It compiles a subset of
OpenCL C and executes it on a dedicated queue thread.
- [`Backend::OpenCl`]: OpenCL devices, requires the "device" feature.
*/

use crate::{
    buffer::AccessMode,
    dispatch::WorkGrid,
    error::{codes::*, Error, Stage},
    future::{Completion, PendingBytes, PendingWork},
    kernel::Param,
    result::Result,
    scalar::ScalarElem,
};
use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

mod sim_engine;

#[cfg(feature = "device")]
mod opencl_engine;

/// Device classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DeviceKind {
    /// Graphics processors.
    #[display(fmt = "gpu")]
    Gpu,
    /// Host processors.
    #[display(fmt = "cpu")]
    Cpu,
    /// Dedicated accelerators.
    #[display(fmt = "accelerator")]
    Accelerator,
    /// Anything else.
    #[display(fmt = "other")]
    Other,
    /// Matches every device.
    #[display(fmt = "any")]
    All,
}

impl DeviceKind {
    /// Whether a device of class `kind` passes this filter.
    pub fn matches(&self, kind: DeviceKind) -> bool {
        *self == DeviceKind::All || *self == kind
    }
}

impl FromStr for DeviceKind {
    type Err = String;
    fn from_str(input: &str) -> Result<Self, String> {
        let kind = match input.to_ascii_lowercase().as_str() {
            "gpu" => Self::Gpu,
            "cpu" => Self::Cpu,
            "accelerator" => Self::Accelerator,
            "other" => Self::Other,
            "all" | "any" => Self::All,
            _ => {
                return Err(format!(
                    "unknown device kind {input:?}, expected gpu, cpu, accelerator or all"
                ))
            }
        };
        Ok(kind)
    }
}

/// Device backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Backend {
    /// The simulated accelerator.
    #[default]
    #[display(fmt = "sim")]
    Sim,
    /// OpenCL platforms.
    #[display(fmt = "opencl")]
    OpenCl,
}

impl Backend {
    /// Whether the backend was compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Sim => true,
            Self::OpenCl => cfg!(feature = "device"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;
    fn from_str(input: &str) -> Result<Self, String> {
        match input.to_ascii_lowercase().as_str() {
            "sim" => Ok(Self::Sim),
            "opencl" | "cl" => Ok(Self::OpenCl),
            _ => Err(format!("unknown backend {input:?}, expected sim or opencl")),
        }
    }
}

/// Device info.
///
/// A snapshot of the capabilities of a device, queried when the device is enumerated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    index: usize,
    kind: DeviceKind,
    name: String,
    vendor: String,
    max_compute_units: u32,
    max_work_item_dimensions: u32,
    max_work_item_sizes: Vec<usize>,
    max_work_group_size: usize,
    global_mem_size: u64,
    local_mem_size: u64,
    max_mem_alloc_size: u64,
}

impl DeviceInfo {
    /// Index of the device in its registry.
    pub fn index(&self) -> usize {
        self.index
    }
    /// Device class.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Vendor name.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }
    /// Number of parallel compute units.
    pub fn max_compute_units(&self) -> u32 {
        self.max_compute_units
    }
    /// Maximum dimensions of a work grid.
    pub fn max_work_item_dimensions(&self) -> u32 {
        self.max_work_item_dimensions
    }
    /// Maximum work-items per work-group, per dimension.
    pub fn max_work_item_sizes(&self) -> &[usize] {
        &self.max_work_item_sizes
    }
    /// Maximum work-items in a work-group.
    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }
    /// Global memory in bytes.
    pub fn global_mem_size(&self) -> u64 {
        self.global_mem_size
    }
    /// Local memory in bytes.
    pub fn local_mem_size(&self) -> u64 {
        self.local_mem_size
    }
    /// Maximum size of a single allocation in bytes.
    pub fn max_mem_alloc_size(&self) -> u64 {
        self.max_mem_alloc_size
    }
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Device Name: {}", self.name)?;
        writeln!(f, "Vendor: {}", self.vendor)?;
        writeln!(f, "Max Compute Units: {}", self.max_compute_units)?;
        writeln!(
            f,
            "Max Work Item Dimensions: {}",
            self.max_work_item_dimensions
        )?;
        write!(f, "Max Work Item Sizes: ")?;
        for (i, size) in self.max_work_item_sizes.iter().enumerate() {
            if i > 0 {
                write!(f, " / ")?;
            }
            write!(f, "{size}")?;
        }
        writeln!(f)?;
        writeln!(f, "Max Work Group Size: {}", self.max_work_group_size)?;
        writeln!(
            f,
            "Global Memory Size: {} MB",
            self.global_mem_size / (1024 * 1024)
        )?;
        write!(f, "Local Memory Size: {} KB", self.local_mem_size / 1024)
    }
}

/** A simulated device.

The default devices mirror a typical discrete GPU and a host CPU:
```
# use clpipe::device::{DeviceKind, SimDevice};
let gpu = SimDevice::gpu().with_max_work_group_size(256);
assert_eq!(gpu.kind(), DeviceKind::Gpu);
```

Faults can be injected for testing failure handling, see
[`with_latency`](SimDevice::with_latency),
[`with_context_failure`](SimDevice::with_context_failure) and
[`with_queue_failure`](SimDevice::with_queue_failure).
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimDevice {
    kind: DeviceKind,
    name: String,
    vendor: String,
    max_compute_units: u32,
    max_work_item_sizes: [usize; 3],
    max_work_group_size: usize,
    global_mem_size: u64,
    local_mem_size: u64,
    latency: Duration,
    context_failure: Option<i32>,
    queue_failure: Option<i32>,
}

impl SimDevice {
    /// A simulated GPU.
    pub fn gpu() -> Self {
        Self {
            kind: DeviceKind::Gpu,
            name: "clpipe simulated GPU".into(),
            vendor: "clpipe".into(),
            max_compute_units: 16,
            max_work_item_sizes: [1024, 1024, 64],
            max_work_group_size: 1024,
            global_mem_size: 256 * 1024 * 1024,
            local_mem_size: 48 * 1024,
            latency: Duration::ZERO,
            context_failure: None,
            queue_failure: None,
        }
    }
    /// A simulated CPU.
    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            name: "clpipe simulated CPU".into(),
            max_compute_units: 4,
            max_work_item_sizes: [8192, 8192, 8192],
            max_work_group_size: 8192,
            global_mem_size: 512 * 1024 * 1024,
            local_mem_size: 32 * 1024,
            ..Self::gpu()
        }
    }
    /// Device class.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
    /// Sets the device class.
    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }
    /// Sets the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    /// Sets the number of compute units.
    pub fn with_max_compute_units(mut self, max_compute_units: u32) -> Self {
        self.max_compute_units = max_compute_units;
        self
    }
    /// Sets the per dimension work-group limits.
    pub fn with_max_work_item_sizes(mut self, max_work_item_sizes: [usize; 3]) -> Self {
        self.max_work_item_sizes = max_work_item_sizes;
        self
    }
    /// Sets the work-group limit.
    pub fn with_max_work_group_size(mut self, max_work_group_size: usize) -> Self {
        self.max_work_group_size = max_work_group_size;
        self
    }
    /// Sets the global memory size in bytes.
    ///
    /// A single allocation is limited to a quarter of global memory.
    pub fn with_global_mem_size(mut self, global_mem_size: u64) -> Self {
        self.global_mem_size = global_mem_size;
        self
    }
    /// Delays every kernel dispatch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
    /// Context creation fails with platform `code`.
    pub fn with_context_failure(mut self, code: i32) -> Self {
        self.context_failure = Some(code);
        self
    }
    /// Queue creation fails with platform `code`.
    pub fn with_queue_failure(mut self, code: i32) -> Self {
        self.queue_failure = Some(code);
        self
    }
}

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`DeviceRegistry`].
    pub struct RegistryBuilder {
        pub(super) backend: Backend,
        pub(super) sim_devices: Vec<SimDevice>,
    }

    impl RegistryBuilder {
        /// The backend, defaults to [`Backend::Sim`].
        pub fn backend(mut self, backend: Backend) -> Self {
            self.backend = backend;
            self
        }
        /// Replaces the simulated devices, defaults to a GPU and a CPU.
        ///
        /// Ignored by other backends.
        pub fn sim_devices(mut self, sim_devices: impl IntoIterator<Item = SimDevice>) -> Self {
            self.sim_devices = sim_devices.into_iter().collect();
            self
        }
        /// Enumerates the devices.
        ///
        /// **errors**
        /// - [`DeviceQueryFailed`](Error::DeviceQueryFailed) if the platform could not be
        /// queried. Without the "device" feature this is the case for [`Backend::OpenCl`].
        pub fn build(self) -> Result<DeviceRegistry> {
            let devices: Vec<Device> = match self.backend {
                Backend::Sim => self
                    .sim_devices
                    .iter()
                    .enumerate()
                    .map(|(index, desc)| Device {
                        inner: DeviceInner::Sim(sim_engine::Engine::new(index, desc)),
                    })
                    .collect(),
                Backend::OpenCl => {
                    #[cfg(feature = "device")]
                    {
                        opencl_engine::Engine::enumerate()?
                            .into_iter()
                            .map(|engine| Device {
                                inner: DeviceInner::OpenCl(engine),
                            })
                            .collect()
                    }
                    #[cfg(not(feature = "device"))]
                    {
                        return Err(Error::DeviceQueryFailed {
                            code: CL_PLATFORM_NOT_FOUND_KHR,
                        });
                    }
                }
            };
            log::debug!("{} backend: {} device(s)", self.backend, devices.len());
            Ok(DeviceRegistry {
                backend: self.backend,
                devices,
            })
        }
    }
}
use builder::RegistryBuilder;

/// Enumerates devices.
#[derive(Debug)]
pub struct DeviceRegistry {
    backend: Backend,
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// A builder for creating a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            backend: Backend::default(),
            sim_devices: vec![SimDevice::gpu(), SimDevice::cpu()],
        }
    }
    /// A registry of the default devices of `backend`.
    pub fn new(backend: Backend) -> Result<Self> {
        Self::builder().backend(backend).build()
    }
    /// The backend.
    pub fn backend(&self) -> Backend {
        self.backend
    }
    /// The devices of class `kind`, in platform order.
    ///
    /// **errors**
    /// - [`NoDeviceFound`](Error::NoDeviceFound) if there are none.
    pub fn list_devices(&self, kind: DeviceKind) -> Result<Vec<Device>> {
        let devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|device| kind.matches(device.info().kind()))
            .cloned()
            .collect();
        if devices.is_empty() {
            return Err(Error::NoDeviceFound { kind });
        }
        Ok(devices)
    }
    /// The first device of class `kind`.
    ///
    /// **errors**
    /// - [`NoDeviceFound`](Error::NoDeviceFound) if there are none.
    pub fn select_first(&self, kind: DeviceKind) -> Result<Device> {
        self.devices
            .iter()
            .find(|device| kind.matches(device.info().kind()))
            .cloned()
            .ok_or(Error::NoDeviceFound { kind })
    }
    /// The capabilities of `device`.
    pub fn describe(&self, device: &Device) -> Arc<DeviceInfo> {
        device.info().clone()
    }
}

/** A device.

Devices can be cloned, which is equivalent to [`Arc::clone()`]. Clones compare equal,
distinct devices do not:
```
# use clpipe::{result::Result, device::{DeviceKind, DeviceRegistry}};
# fn main() -> Result<()> {
let registry = DeviceRegistry::builder().build()?;
let gpu = registry.select_first(DeviceKind::Gpu)?;
let cpu = registry.select_first(DeviceKind::Cpu)?;
assert_eq!(gpu, gpu.clone());
assert_ne!(gpu, cpu);
# Ok(())
# }
```
*/
#[derive(Clone, Eq, PartialEq)]
pub struct Device {
    inner: DeviceInner,
}

impl Device {
    /// Device info.
    pub fn info(&self) -> &Arc<DeviceInfo> {
        match &self.inner {
            DeviceInner::Sim(engine) => engine.info(),
            #[cfg(feature = "device")]
            DeviceInner::OpenCl(engine) => engine.info(),
        }
    }
    /// The backend of the device.
    pub fn backend(&self) -> Backend {
        match &self.inner {
            DeviceInner::Sim(_) => Backend::Sim,
            #[cfg(feature = "device")]
            DeviceInner::OpenCl(_) => Backend::OpenCl,
        }
    }
    pub(crate) fn create_context(&self) -> Result<RawContext> {
        match &self.inner {
            DeviceInner::Sim(engine) => {
                sim_engine::Engine::create_context(engine).map(RawContext::Sim)
            }
            #[cfg(feature = "device")]
            DeviceInner::OpenCl(engine) => {
                opencl_engine::Engine::create_context(engine).map(RawContext::OpenCl)
            }
        }
    }
}

/// Prints `Device(backend:index)`.
///
/// See [`.info()`](Device::info) for printing device info.
impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}:{})", self.backend(), self.info().index())
    }
}

#[derive(Clone)]
enum DeviceInner {
    Sim(Arc<sim_engine::Engine>),
    #[cfg(feature = "device")]
    OpenCl(Arc<opencl_engine::Engine>),
}

impl PartialEq for DeviceInner {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Sim(a), Self::Sim(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "device")]
            (Self::OpenCl(a), Self::OpenCl(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "device")]
            _ => false,
        }
    }
}

impl Eq for DeviceInner {}

trait DeviceEngine: Sized {
    type Context: EngineContext;
    fn info(&self) -> &Arc<DeviceInfo>;
    fn create_context(engine: &Arc<Self>) -> Result<Self::Context>;
}

pub(crate) struct BuildOutput {
    pub(crate) built: bool,
    pub(crate) log: String,
}

trait EngineContext: Sized {
    type Queue: EngineQueue<Buffer = Self::Buffer, Kernel = Self::Kernel>;
    type Program: EngineProgram<Kernel = Self::Kernel>;
    type Kernel: EngineKernel<Buffer = Self::Buffer>;
    type Buffer;
    fn create_queue(&self) -> Result<Self::Queue>;
    /// Compiles `source`, returning the program even if the build failed.
    fn compile(&self, source: &str) -> Result<(Self::Program, BuildOutput)>;
    fn allocate(&self, bytes: usize, access: AccessMode) -> Result<Self::Buffer>;
}

trait EngineProgram {
    type Kernel;
    fn entry_points(&self) -> Vec<String>;
    fn create_kernel(&self, entry: &str) -> Result<Self::Kernel>;
}

trait EngineKernel {
    type Buffer;
    fn params(&self) -> Vec<Param>;
    fn preferred_work_group_size(&self, info: &DeviceInfo) -> Result<usize>;
    fn set_buffer(&self, index: usize, buffer: &Self::Buffer) -> Result<()>;
    fn set_scalar(&self, index: usize, value: ScalarElem) -> Result<()>;
}

trait EngineQueue {
    type Buffer;
    type Kernel;
    fn upload(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
        completion: Completion,
    ) -> Result<PendingWork>;
    fn download(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        len: usize,
        completion: Completion,
    ) -> Result<PendingBytes>;
    fn dispatch(&self, kernel: &Self::Kernel, grid: &WorkGrid) -> Result<PendingWork>;
    /// Waits for all submitted commands.
    fn finish(&self, timeout: Option<Duration>) -> Result<()>;
}

#[cfg(feature = "device")]
fn backend_mismatch(stage: Stage) -> Error {
    Error::SubmissionFailed {
        stage,
        code: CL_INVALID_CONTEXT,
        message: "resources belong to different backends".into(),
    }
}

pub(crate) enum RawContext {
    Sim(sim_engine::Context),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Context),
}

impl RawContext {
    pub(crate) fn create_queue(&self) -> Result<RawQueue> {
        match self {
            Self::Sim(context) => context.create_queue().map(RawQueue::Sim),
            #[cfg(feature = "device")]
            Self::OpenCl(context) => context.create_queue().map(RawQueue::OpenCl),
        }
    }
    pub(crate) fn compile(&self, source: &str) -> Result<(RawProgram, BuildOutput)> {
        match self {
            Self::Sim(context) => context
                .compile(source)
                .map(|(program, output)| (RawProgram::Sim(program), output)),
            #[cfg(feature = "device")]
            Self::OpenCl(context) => context
                .compile(source)
                .map(|(program, output)| (RawProgram::OpenCl(program), output)),
        }
    }
    /// Zero sized buffers are not allocated.
    pub(crate) fn allocate(&self, bytes: usize, access: AccessMode) -> Result<RawBuffer> {
        if bytes == 0 {
            return Ok(RawBuffer::Empty);
        }
        match self {
            Self::Sim(context) => context.allocate(bytes, access).map(RawBuffer::Sim),
            #[cfg(feature = "device")]
            Self::OpenCl(context) => context.allocate(bytes, access).map(RawBuffer::OpenCl),
        }
    }
}

pub(crate) enum RawQueue {
    Sim(sim_engine::Queue),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Queue),
}

impl RawQueue {
    pub(crate) fn upload(
        &self,
        buffer: &RawBuffer,
        offset: usize,
        data: &[u8],
        completion: Completion,
    ) -> Result<PendingWork> {
        match (self, buffer) {
            (_, RawBuffer::Empty) => Ok(PendingWork::ready()),
            (Self::Sim(queue), RawBuffer::Sim(buffer)) => {
                queue.upload(buffer, offset, data, completion)
            }
            #[cfg(feature = "device")]
            (Self::OpenCl(queue), RawBuffer::OpenCl(buffer)) => {
                queue.upload(buffer, offset, data, completion)
            }
            #[cfg(feature = "device")]
            _ => Err(backend_mismatch(Stage::Upload)),
        }
    }
    pub(crate) fn download(
        &self,
        buffer: &RawBuffer,
        offset: usize,
        len: usize,
        completion: Completion,
    ) -> Result<PendingBytes> {
        match (self, buffer) {
            (_, RawBuffer::Empty) => Ok(PendingBytes::ready(Vec::new())),
            (Self::Sim(queue), RawBuffer::Sim(buffer)) => {
                queue.download(buffer, offset, len, completion)
            }
            #[cfg(feature = "device")]
            (Self::OpenCl(queue), RawBuffer::OpenCl(buffer)) => {
                queue.download(buffer, offset, len, completion)
            }
            #[cfg(feature = "device")]
            _ => Err(backend_mismatch(Stage::Download)),
        }
    }
    pub(crate) fn dispatch(&self, kernel: &RawKernel, grid: &WorkGrid) -> Result<PendingWork> {
        match (self, kernel) {
            (Self::Sim(queue), RawKernel::Sim(kernel)) => queue.dispatch(kernel, grid),
            #[cfg(feature = "device")]
            (Self::OpenCl(queue), RawKernel::OpenCl(kernel)) => queue.dispatch(kernel, grid),
            #[cfg(feature = "device")]
            _ => Err(backend_mismatch(Stage::Dispatch)),
        }
    }
    pub(crate) fn finish(&self, timeout: Option<Duration>) -> Result<()> {
        match self {
            Self::Sim(queue) => queue.finish(timeout),
            #[cfg(feature = "device")]
            Self::OpenCl(queue) => queue.finish(timeout),
        }
    }
}

pub(crate) enum RawProgram {
    Sim(sim_engine::Program),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Program),
}

impl RawProgram {
    pub(crate) fn entry_points(&self) -> Vec<String> {
        match self {
            Self::Sim(program) => program.entry_points(),
            #[cfg(feature = "device")]
            Self::OpenCl(program) => program.entry_points(),
        }
    }
    pub(crate) fn create_kernel(&self, entry: &str) -> Result<RawKernel> {
        match self {
            Self::Sim(program) => program.create_kernel(entry).map(RawKernel::Sim),
            #[cfg(feature = "device")]
            Self::OpenCl(program) => program.create_kernel(entry).map(RawKernel::OpenCl),
        }
    }
}

pub(crate) enum RawKernel {
    Sim(sim_engine::Kernel),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Kernel),
}

impl RawKernel {
    pub(crate) fn params(&self) -> Vec<Param> {
        match self {
            Self::Sim(kernel) => kernel.params(),
            #[cfg(feature = "device")]
            Self::OpenCl(kernel) => kernel.params(),
        }
    }
    pub(crate) fn preferred_work_group_size(&self, info: &DeviceInfo) -> Result<usize> {
        match self {
            Self::Sim(kernel) => kernel.preferred_work_group_size(info),
            #[cfg(feature = "device")]
            Self::OpenCl(kernel) => kernel.preferred_work_group_size(info),
        }
    }
    pub(crate) fn set_buffer(&self, index: usize, buffer: &RawBuffer) -> Result<()> {
        match (self, buffer) {
            (Self::Sim(kernel), RawBuffer::Sim(buffer)) => kernel.set_buffer(index, buffer),
            #[cfg(feature = "device")]
            (Self::OpenCl(kernel), RawBuffer::OpenCl(buffer)) => kernel.set_buffer(index, buffer),
            _ => Err(Error::SubmissionFailed {
                stage: Stage::Arguments,
                code: CL_INVALID_MEM_OBJECT,
                message: "buffer can not be bound to this kernel".into(),
            }),
        }
    }
    pub(crate) fn set_scalar(&self, index: usize, value: ScalarElem) -> Result<()> {
        match self {
            Self::Sim(kernel) => kernel.set_scalar(index, value),
            #[cfg(feature = "device")]
            Self::OpenCl(kernel) => kernel.set_scalar(index, value),
        }
    }
}

pub(crate) enum RawBuffer {
    /// A zero sized buffer.
    Empty,
    Sim(sim_engine::Buffer),
    #[cfg(feature = "device")]
    OpenCl(opencl_engine::Buffer),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_filters() {
        assert!(DeviceKind::All.matches(DeviceKind::Cpu));
        assert!(DeviceKind::Gpu.matches(DeviceKind::Gpu));
        assert!(!DeviceKind::Gpu.matches(DeviceKind::Cpu));
        assert_eq!("GPU".parse::<DeviceKind>(), Ok(DeviceKind::Gpu));
        assert!("tpu".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn registry_filters_by_kind() {
        let registry = DeviceRegistry::builder()
            .sim_devices([
                SimDevice::cpu(),
                SimDevice::gpu().with_name("a"),
                SimDevice::gpu().with_name("b"),
            ])
            .build()
            .unwrap();
        let gpus = registry.list_devices(DeviceKind::Gpu).unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].info().name(), "a");
        assert_eq!(gpus[0].info().index(), 1);
        assert_eq!(registry.list_devices(DeviceKind::All).unwrap().len(), 3);
        assert_eq!(
            registry.select_first(DeviceKind::Accelerator),
            Err(Error::NoDeviceFound {
                kind: DeviceKind::Accelerator
            })
        );
        assert_eq!(
            registry.list_devices(DeviceKind::Accelerator).unwrap_err(),
            Error::NoDeviceFound {
                kind: DeviceKind::Accelerator
            }
        );
    }

    #[test]
    fn describe_is_repeatable() {
        let registry = DeviceRegistry::new(Backend::Sim).unwrap();
        let device = registry.select_first(DeviceKind::Gpu).unwrap();
        let a = registry.describe(&device);
        let b = registry.describe(&device);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.max_mem_alloc_size(), a.global_mem_size() / 4);
    }

    #[test]
    fn device_info_display() {
        let registry = DeviceRegistry::builder()
            .sim_devices([SimDevice::gpu()])
            .build()
            .unwrap();
        let info = registry.describe(&registry.select_first(DeviceKind::Gpu).unwrap());
        assert_eq!(
            info.to_string(),
            "Device Name: clpipe simulated GPU
Vendor: clpipe
Max Compute Units: 16
Max Work Item Dimensions: 3
Max Work Item Sizes: 1024 / 1024 / 64
Max Work Group Size: 1024
Global Memory Size: 256 MB
Local Memory Size: 48 KB"
        );
    }

    #[cfg(not(feature = "device"))]
    #[test]
    fn opencl_requires_the_device_feature() {
        assert!(!Backend::OpenCl.is_available());
        assert_eq!(
            DeviceRegistry::new(Backend::OpenCl).unwrap_err(),
            Error::DeviceQueryFailed {
                code: CL_PLATFORM_NOT_FOUND_KHR
            }
        );
    }
}
