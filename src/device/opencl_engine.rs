//! OpenCL devices.

use super::{
    BuildOutput, DeviceEngine, DeviceInfo, DeviceKind, EngineContext, EngineKernel,
    EngineProgram, EngineQueue,
};
use crate::{
    buffer::AccessMode,
    dispatch::WorkGrid,
    error::{codes::*, Error, Stage},
    future::{Completion, PendingBytes, PendingWork},
    kernel::{Param, ParamKind},
    result::Result,
    scalar::{ScalarElem, ScalarType},
};
use crossbeam_channel::{bounded, RecvTimeoutError};
use opencl3::{
    command_queue::CommandQueue,
    context::Context as ClContext,
    device::{
        get_all_devices, Device as ClDevice, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL,
        CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
    },
    error_codes::ClError,
    event::Event,
    kernel::{Kernel as ClKernel, CL_KERNEL_ARG_ADDRESS_CONSTANT, CL_KERNEL_ARG_ADDRESS_GLOBAL},
    memory::{Buffer as ClBuffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY},
    program::Program as ClProgram,
    types::{cl_uint, CL_BLOCKING, CL_NON_BLOCKING},
};
use parking_lot::Mutex;
use std::{ptr, sync::Arc, time::Duration};

fn submission(stage: Stage, error: ClError, message: &str) -> Error {
    Error::SubmissionFailed {
        stage,
        code: error.0,
        message: message.to_string(),
    }
}

pub(crate) struct Engine {
    info: Arc<DeviceInfo>,
    device: ClDevice,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for devices, contexts, command queues, programs
// and memory objects. Kernels are only mutated through argument binding, which is serialized
// by the owning `KernelHandle`.
unsafe impl Send for Engine {}
unsafe impl Sync for Engine {}

impl Engine {
    /// All devices of all platforms, in platform order.
    pub(super) fn enumerate() -> Result<Vec<Arc<Self>>> {
        let ids = match get_all_devices(CL_DEVICE_TYPE_ALL) {
            Ok(ids) => ids,
            Err(ClError(CL_DEVICE_NOT_FOUND)) => Vec::new(),
            Err(e) => return Err(Error::DeviceQueryFailed { code: e.0 }),
        };
        ids.into_iter()
            .enumerate()
            .map(|(index, id)| Self::new(index, ClDevice::new(id)))
            .collect()
    }
    fn new(index: usize, device: ClDevice) -> Result<Arc<Self>> {
        let query = |e: ClError| Error::DeviceQueryFailed { code: e.0 };
        let dev_type = device.dev_type().map_err(query)?;
        let kind = if dev_type & CL_DEVICE_TYPE_GPU != 0 {
            DeviceKind::Gpu
        } else if dev_type & CL_DEVICE_TYPE_CPU != 0 {
            DeviceKind::Cpu
        } else if dev_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
            DeviceKind::Accelerator
        } else {
            DeviceKind::Other
        };
        let info = DeviceInfo {
            index,
            kind,
            name: device.name().map_err(query)?.trim_end_matches('\0').to_string(),
            vendor: device.vendor().map_err(query)?.trim_end_matches('\0').to_string(),
            max_compute_units: device.max_compute_units().map_err(query)?,
            max_work_item_dimensions: device.max_work_item_dimensions().map_err(query)?,
            max_work_item_sizes: device.max_work_item_sizes().map_err(query)?,
            max_work_group_size: device.max_work_group_size().map_err(query)?,
            global_mem_size: device.global_mem_size().map_err(query)?,
            local_mem_size: device.local_mem_size().map_err(query)?,
            max_mem_alloc_size: device.max_mem_alloc_size().map_err(query)?,
        };
        log::debug!("opencl device {index}: {info:?}");
        Ok(Arc::new(Self {
            info: Arc::new(info),
            device,
        }))
    }
}

impl DeviceEngine for Engine {
    type Context = Context;
    fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    fn create_context(engine: &Arc<Self>) -> Result<Context> {
        let context = ClContext::from_device(&engine.device)
            .map_err(|e| Error::ContextCreationFailed { code: e.0 })?;
        Ok(Context {
            engine: engine.clone(),
            context,
        })
    }
}

pub(crate) struct Context {
    engine: Arc<Engine>,
    context: ClContext,
}

// SAFETY: See `Engine`.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl EngineContext for Context {
    type Queue = Queue;
    type Program = Program;
    type Kernel = Kernel;
    type Buffer = Buffer;
    fn create_queue(&self) -> Result<Queue> {
        // create_default is the OpenCL 1.2 entry point, available on every platform.
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&self.context, 0)
            .map_err(|e| Error::QueueCreationFailed { code: e.0 })?;
        Ok(Queue { queue })
    }
    fn compile(&self, source: &str) -> Result<(Program, BuildOutput)> {
        let device_id = self.engine.device.id();
        let mut program = ClProgram::create_from_source(&self.context, source)
            .map_err(|e| submission(Stage::Build, e, "failed to create program"))?;
        let result = program.build(&[device_id], "-cl-kernel-arg-info");
        let log = program.get_build_log(device_id).unwrap_or_default();
        let log = if log.trim_matches(|c: char| c.is_whitespace() || c == '\0').is_empty() {
            String::new()
        } else {
            log.trim_end_matches('\0').to_string()
        };
        let built = match result {
            Ok(()) => true,
            Err(ClError(CL_BUILD_PROGRAM_FAILURE)) => false,
            Err(e) => return Err(submission(Stage::Build, e, "failed to build program")),
        };
        Ok((
            Program {
                program,
                device_id: self.engine.device.id(),
            },
            BuildOutput { built, log },
        ))
    }
    fn allocate(&self, bytes: usize, access: AccessMode) -> Result<Buffer> {
        if bytes as u64 > self.engine.info.max_mem_alloc_size {
            return Err(Error::AllocationFailed {
                bytes,
                code: CL_INVALID_BUFFER_SIZE,
            });
        }
        let flags = match access {
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
            AccessMode::ReadWrite => CL_MEM_READ_WRITE,
        };
        let buffer =
            unsafe { ClBuffer::<u8>::create(&self.context, flags, bytes, ptr::null_mut()) }
                .map_err(|e| Error::AllocationFailed { bytes, code: e.0 })?;
        Ok(Buffer {
            buffer: Mutex::new(buffer),
        })
    }
}

pub(crate) struct Program {
    program: ClProgram,
    device_id: opencl3::types::cl_device_id,
}

// SAFETY: See `Engine`.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl EngineProgram for Program {
    type Kernel = Kernel;
    fn entry_points(&self) -> Vec<String> {
        match self.program.get_kernel_names() {
            Ok(names) => names
                .trim_end_matches('\0')
                .split(';')
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                log::warn!("failed to query kernel names: {e:?}");
                Vec::new()
            }
        }
    }
    fn create_kernel(&self, entry: &str) -> Result<Kernel> {
        let kernel = ClKernel::create(&self.program, entry).map_err(|e| match e.0 {
            CL_INVALID_KERNEL_NAME => Error::EntryNotFound {
                name: entry.to_string(),
            },
            _ => submission(Stage::Kernel, e, "failed to create kernel"),
        })?;
        Ok(Kernel {
            kernel,
            device_id: self.device_id,
        })
    }
}

pub(crate) struct Kernel {
    kernel: ClKernel,
    device_id: opencl3::types::cl_device_id,
}

// SAFETY: See `Engine`.
unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

fn parse_arg_type(type_name: &str) -> Option<ScalarType> {
    type_name
        .trim_end_matches('\0')
        .trim_end_matches('*')
        .split_whitespace()
        .filter(|word| !matches!(*word, "const" | "volatile" | "restrict"))
        .last()?
        .parse()
        .ok()
}

impl EngineKernel for Kernel {
    type Buffer = Buffer;
    fn params(&self) -> Vec<Param> {
        let arity = match self.kernel.num_args() {
            Ok(arity) => arity,
            Err(e) => {
                log::warn!("failed to query kernel arguments: {e:?}");
                return Vec::new();
            }
        };
        (0..arity)
            .map(|index| {
                let name = self
                    .kernel
                    .get_arg_name(index)
                    .map(|name| name.trim_end_matches('\0').to_string())
                    .unwrap_or_else(|_| format!("arg{index}"));
                let kind = match (
                    self.kernel.get_arg_address_qualifier(index),
                    self.kernel.get_arg_type_name(index),
                ) {
                    (Ok(CL_KERNEL_ARG_ADDRESS_GLOBAL | CL_KERNEL_ARG_ADDRESS_CONSTANT), type_name) => {
                        ParamKind::Buffer {
                            elem: type_name.ok().and_then(|name| parse_arg_type(&name)),
                        }
                    }
                    (Ok(_), Ok(type_name)) => parse_arg_type(&type_name)
                        .map(ParamKind::Scalar)
                        .unwrap_or(ParamKind::Unknown),
                    _ => ParamKind::Unknown,
                };
                Param { name, kind }
            })
            .collect()
    }
    fn preferred_work_group_size(&self, _info: &DeviceInfo) -> Result<usize> {
        self.kernel
            .get_work_group_size(self.device_id)
            .map_err(|e| submission(Stage::Kernel, e, "failed to query work-group size"))
    }
    fn set_buffer(&self, index: usize, buffer: &Buffer) -> Result<()> {
        let mem = buffer.buffer.lock().get();
        unsafe { self.kernel.set_arg(index as cl_uint, &mem) }
            .map_err(|e| submission(Stage::Arguments, e, "failed to bind buffer"))
    }
    fn set_scalar(&self, index: usize, value: ScalarElem) -> Result<()> {
        let index = index as cl_uint;
        let result = unsafe {
            match value {
                ScalarElem::U8(x) => self.kernel.set_arg(index, &x),
                ScalarElem::I8(x) => self.kernel.set_arg(index, &x),
                ScalarElem::U16(x) => self.kernel.set_arg(index, &x),
                ScalarElem::I16(x) => self.kernel.set_arg(index, &x),
                ScalarElem::U32(x) => self.kernel.set_arg(index, &x),
                ScalarElem::I32(x) => self.kernel.set_arg(index, &x),
                ScalarElem::F32(x) => self.kernel.set_arg(index, &x),
                ScalarElem::U64(x) => self.kernel.set_arg(index, &x),
                ScalarElem::I64(x) => self.kernel.set_arg(index, &x),
                ScalarElem::F64(x) => self.kernel.set_arg(index, &x),
            }
        };
        result.map_err(|e| submission(Stage::Arguments, e, "failed to bind scalar"))
    }
}

pub(crate) struct Buffer {
    buffer: Mutex<ClBuffer<u8>>,
}

// SAFETY: See `Engine`.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

/// A queued command.
struct PendingEvent(Event);

// SAFETY: OpenCL event objects are thread safe.
unsafe impl Send for PendingEvent {}

impl PendingEvent {
    fn wait(&self, stage: Stage) -> Result<()> {
        self.0
            .wait()
            .map_err(|e| submission(stage, e, "command did not complete"))
    }
}

/// Host memory read or written by a queued transfer.
///
/// Dropping waits for the transfer, the memory must outlive it.
struct Staged {
    event: PendingEvent,
    data: Vec<u8>,
}

impl Drop for Staged {
    fn drop(&mut self) {
        self.event.0.wait().ok();
    }
}

pub(crate) struct Queue {
    queue: CommandQueue,
}

// SAFETY: See `Engine`.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl EngineQueue for Queue {
    type Buffer = Buffer;
    type Kernel = Kernel;
    fn upload(
        &self,
        buffer: &Buffer,
        offset: usize,
        data: &[u8],
        completion: Completion,
    ) -> Result<PendingWork> {
        let mut buffer = buffer.buffer.lock();
        let failed = |e| submission(Stage::Upload, e, "failed to write buffer");
        match completion {
            Completion::Blocking => {
                unsafe {
                    self.queue
                        .enqueue_write_buffer(&mut buffer, CL_BLOCKING, offset, data, &[])
                }
                .map_err(failed)?;
                Ok(PendingWork::ready())
            }
            Completion::Deferred => {
                let data = data.to_vec();
                let event = unsafe {
                    self.queue
                        .enqueue_write_buffer(&mut buffer, CL_NON_BLOCKING, offset, &data, &[])
                }
                .map_err(failed)?;
                let staged = Staged {
                    event: PendingEvent(event),
                    data,
                };
                Ok(PendingWork::deferred(move || {
                    staged.event.wait(Stage::Upload)
                }))
            }
        }
    }
    fn download(
        &self,
        buffer: &Buffer,
        offset: usize,
        len: usize,
        completion: Completion,
    ) -> Result<PendingBytes> {
        let buffer = buffer.buffer.lock();
        let failed = |e| submission(Stage::Download, e, "failed to read buffer");
        let mut data = vec![0u8; len];
        match completion {
            Completion::Blocking => {
                unsafe {
                    self.queue
                        .enqueue_read_buffer(&buffer, CL_BLOCKING, offset, &mut data, &[])
                }
                .map_err(failed)?;
                Ok(PendingBytes::ready(data))
            }
            Completion::Deferred => {
                let event = unsafe {
                    self.queue
                        .enqueue_read_buffer(&buffer, CL_NON_BLOCKING, offset, &mut data, &[])
                }
                .map_err(failed)?;
                let mut staged = Staged {
                    event: PendingEvent(event),
                    data,
                };
                Ok(PendingBytes::deferred(move || {
                    staged.event.wait(Stage::Download)?;
                    Ok(std::mem::take(&mut staged.data))
                }))
            }
        }
    }
    fn dispatch(&self, kernel: &Kernel, grid: &WorkGrid) -> Result<PendingWork> {
        let dims = grid.dims();
        let global = grid.global_size();
        let local = grid.local_size().map_or(ptr::null(), |local| local.as_ptr());
        let event = unsafe {
            self.queue.enqueue_nd_range_kernel(
                kernel.kernel.get(),
                dims as cl_uint,
                ptr::null(),
                global.as_ptr(),
                local,
                &[],
            )
        }
        .map_err(|e| submission(Stage::Dispatch, e, "failed to enqueue kernel"))?;
        let event = PendingEvent(event);
        Ok(PendingWork::deferred(move || event.wait(Stage::Dispatch)))
    }
    fn finish(&self, timeout: Option<Duration>) -> Result<()> {
        let failed = |e| submission(Stage::Drain, e, "failed to drain queue");
        let timeout = match timeout {
            Some(timeout) => timeout,
            None => return self.queue.finish().map_err(failed),
        };
        let marker = unsafe { self.queue.enqueue_marker_with_wait_list(&[]) }.map_err(failed)?;
        self.queue.flush().map_err(failed)?;
        let marker = PendingEvent(marker);
        let (sender, receiver) = bounded(1);
        std::thread::Builder::new()
            .name("clpipe-opencl-drain".into())
            .spawn(move || {
                sender.send(marker.wait(Stage::Drain)).ok();
            })
            .map_err(|e| Error::SubmissionFailed {
                stage: Stage::Drain,
                code: CL_OUT_OF_HOST_MEMORY,
                message: e.to_string(),
            })?;
        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::DeviceHang { timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::SubmissionFailed {
                stage: Stage::Drain,
                code: CL_OUT_OF_RESOURCES,
                message: "drain thread exited".into(),
            }),
        }
    }
}
