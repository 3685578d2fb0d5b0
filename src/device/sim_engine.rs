//! A simulated accelerator.
//!
//! Programs are compiled from a subset of OpenCL C and executed by an
//! interpreter on a dedicated queue thread. Commands are executed strictly in
//! submission order.

use super::{
    BuildOutput, DeviceEngine, DeviceInfo, EngineContext, EngineKernel, EngineProgram,
    EngineQueue, SimDevice,
};
use crate::{
    buffer::AccessMode,
    dispatch::WorkGrid,
    error::{codes::*, Error, Stage},
    future::{Completion, PendingBytes, PendingWork},
    kernel::{Param, ParamKind},
    result::Result,
    scalar::ScalarElem,
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    fmt::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

mod interp;
mod lexer;
mod parser;

use interp::{Grid, LaunchArg, Memory};
use lexer::Diagnostic;
use parser::{Module, ParamDeclKind};

/// Label of the source text in diagnostics.
const SOURCE_LABEL: &str = "<kernel>";

pub(crate) struct Engine {
    info: Arc<DeviceInfo>,
    latency: Duration,
    context_failure: Option<i32>,
    queue_failure: Option<i32>,
    allocated: Mutex<u64>,
}

impl Engine {
    pub(super) fn new(index: usize, desc: &SimDevice) -> Arc<Self> {
        let info = DeviceInfo {
            index,
            kind: desc.kind,
            name: desc.name.clone(),
            vendor: desc.vendor.clone(),
            max_compute_units: desc.max_compute_units,
            max_work_item_dimensions: 3,
            max_work_item_sizes: desc.max_work_item_sizes.to_vec(),
            max_work_group_size: desc.max_work_group_size,
            global_mem_size: desc.global_mem_size,
            local_mem_size: desc.local_mem_size,
            max_mem_alloc_size: desc.global_mem_size / 4,
        };
        log::trace!("sim device {index}: {info:?}");
        Arc::new(Self {
            info: Arc::new(info),
            latency: desc.latency,
            context_failure: desc.context_failure,
            queue_failure: desc.queue_failure,
            allocated: Mutex::new(0),
        })
    }
}

impl DeviceEngine for Engine {
    type Context = Context;
    fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    fn create_context(engine: &Arc<Self>) -> Result<Context> {
        if let Some(code) = engine.context_failure {
            return Err(Error::ContextCreationFailed { code });
        }
        Ok(Context {
            engine: engine.clone(),
        })
    }
}

pub(crate) struct Context {
    engine: Arc<Engine>,
}

impl EngineContext for Context {
    type Queue = Queue;
    type Program = Program;
    type Kernel = Kernel;
    type Buffer = Buffer;
    fn create_queue(&self) -> Result<Queue> {
        if let Some(code) = self.engine.queue_failure {
            return Err(Error::QueueCreationFailed { code });
        }
        Queue::new(self.engine.clone())
    }
    fn compile(&self, source: &str) -> Result<(Program, BuildOutput)> {
        let mut diagnostics = Vec::new();
        let tokens = lexer::tokenize(source, &mut diagnostics);
        let module = parser::parse(tokens, &mut diagnostics);
        let output = BuildOutput {
            built: diagnostics.is_empty(),
            log: render_diagnostics(source, &diagnostics),
        };
        let program = Program {
            module: Arc::new(module),
        };
        Ok((program, output))
    }
    fn allocate(&self, bytes: usize, access: AccessMode) -> Result<Buffer> {
        let info = &self.engine.info;
        if bytes as u64 > info.max_mem_alloc_size {
            return Err(Error::AllocationFailed {
                bytes,
                code: CL_INVALID_BUFFER_SIZE,
            });
        }
        {
            let mut allocated = self.engine.allocated.lock();
            if *allocated + bytes as u64 > info.global_mem_size {
                return Err(Error::AllocationFailed {
                    bytes,
                    code: CL_MEM_OBJECT_ALLOCATION_FAILURE,
                });
            }
            *allocated += bytes as u64;
        }
        Ok(Buffer {
            storage: Arc::new(Storage {
                engine: self.engine.clone(),
                len: bytes,
                bytes: Mutex::new(vec![0; bytes]),
                access,
            }),
        })
    }
}

fn render_diagnostics(source: &str, diagnostics: &[Diagnostic]) -> String {
    let mut log = String::new();
    if diagnostics.is_empty() {
        return log;
    }
    let lines: Vec<&str> = source.lines().collect();
    for diagnostic in diagnostics {
        let span = diagnostic.span;
        writeln!(
            log,
            "{SOURCE_LABEL}:{}:{}: error: {}",
            span.line, span.col, diagnostic.message
        )
        .ok();
        if let Some(line) = lines.get(span.line.saturating_sub(1) as usize) {
            let indent: String = line
                .chars()
                .take(span.col.saturating_sub(1) as usize)
                .map(|c| if c == '\t' { '\t' } else { ' ' })
                .collect();
            writeln!(log, "{line}\n{indent}^").ok();
        }
    }
    let count = diagnostics.len();
    writeln!(
        log,
        "{count} error{} generated.",
        if count == 1 { "" } else { "s" }
    )
    .ok();
    log
}

pub(crate) struct Program {
    module: Arc<Module>,
}

impl EngineProgram for Program {
    type Kernel = Kernel;
    fn entry_points(&self) -> Vec<String> {
        self.module
            .kernels
            .iter()
            .map(|kernel| kernel.name.clone())
            .collect()
    }
    fn create_kernel(&self, entry: &str) -> Result<Kernel> {
        let index = self
            .module
            .kernels
            .iter()
            .position(|kernel| kernel.name == entry)
            .ok_or_else(|| Error::EntryNotFound {
                name: entry.to_string(),
            })?;
        let arity = self.module.kernels[index].params.len();
        Ok(Kernel {
            module: self.module.clone(),
            index,
            slots: Mutex::new(vec![None; arity]),
        })
    }
}

#[derive(Clone)]
enum Slot {
    Buffer(Arc<Storage>),
    Scalar(ScalarElem),
}

pub(crate) struct Kernel {
    module: Arc<Module>,
    index: usize,
    slots: Mutex<Vec<Option<Slot>>>,
}

impl Kernel {
    fn set(&self, index: usize, slot: Slot) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(index) {
            Some(entry) => {
                *entry = Some(slot);
                Ok(())
            }
            None => Err(Error::IndexOutOfRange {
                kernel: self.module.kernels[self.index].name.clone(),
                index,
                arity: slots.len(),
            }),
        }
    }
}

/// The largest power of two not exceeding the device limit or 64.
pub(super) fn preferred_local_size(info: &DeviceInfo) -> usize {
    let limit = info.max_work_group_size.clamp(1, 64);
    1 << (usize::BITS - 1 - limit.leading_zeros())
}

impl EngineKernel for Kernel {
    type Buffer = Buffer;
    fn params(&self) -> Vec<Param> {
        self.module.kernels[self.index]
            .params
            .iter()
            .map(|param| Param {
                name: param.name.clone(),
                kind: match param.kind {
                    ParamDeclKind::Buffer { elem, .. } => ParamKind::Buffer { elem: Some(elem) },
                    ParamDeclKind::Scalar { ty, .. } => ParamKind::Scalar(ty),
                },
            })
            .collect()
    }
    fn preferred_work_group_size(&self, info: &DeviceInfo) -> Result<usize> {
        Ok(preferred_local_size(info))
    }
    fn set_buffer(&self, index: usize, buffer: &Buffer) -> Result<()> {
        self.set(index, Slot::Buffer(buffer.storage.clone()))
    }
    fn set_scalar(&self, index: usize, value: ScalarElem) -> Result<()> {
        self.set(index, Slot::Scalar(value))
    }
}

struct Storage {
    engine: Arc<Engine>,
    len: usize,
    bytes: Mutex<Vec<u8>>,
    access: AccessMode,
}

impl Drop for Storage {
    fn drop(&mut self) {
        *self.engine.allocated.lock() -= self.len as u64;
    }
}

pub(crate) struct Buffer {
    storage: Arc<Storage>,
}

struct Launch {
    module: Arc<Module>,
    kernel: usize,
    args: Vec<Slot>,
    grid: Grid,
}

enum Op {
    Upload {
        storage: Arc<Storage>,
        offset: usize,
        data: Vec<u8>,
        reply: Sender<Result<()>>,
    },
    Download {
        storage: Arc<Storage>,
        offset: usize,
        len: usize,
        reply: Sender<Result<Vec<u8>>>,
    },
    Dispatch {
        launch: Launch,
        reply: Sender<Result<()>>,
    },
    Marker {
        reply: Sender<()>,
    },
}

pub(crate) struct Queue {
    engine: Arc<Engine>,
    sender: Option<Sender<Op>>,
    worker: Option<JoinHandle<()>>,
    hung: AtomicBool,
}

fn worker_exited(stage: Stage) -> Error {
    Error::SubmissionFailed {
        stage,
        code: CL_INVALID_COMMAND_QUEUE,
        message: "command queue worker exited".into(),
    }
}

impl Queue {
    fn new(engine: Arc<Engine>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let worker = {
            let latency = engine.latency;
            std::thread::Builder::new()
                .name(format!("clpipe-sim-queue-{}", engine.info.index))
                .spawn(move || run_worker(receiver, latency))
                .map_err(|e| {
                    log::error!("failed to spawn queue worker: {e}");
                    Error::QueueCreationFailed {
                        code: CL_OUT_OF_HOST_MEMORY,
                    }
                })?
        };
        Ok(Self {
            engine,
            sender: Some(sender),
            worker: Some(worker),
            hung: AtomicBool::new(false),
        })
    }
    fn send(&self, stage: Stage, op: Op) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| worker_exited(stage))?
            .send(op)
            .map_err(|_| worker_exited(stage))
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // The worker runs every queued command before it exits.
        self.sender.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self.hung.load(Ordering::Relaxed) {
            log::warn!("detaching hung sim queue worker");
        } else if worker.join().is_err() {
            log::error!("sim queue worker panicked");
        }
    }
}

fn deferred<T: Send + 'static>(
    stage: Stage,
    receiver: Receiver<Result<T>>,
) -> impl FnOnce() -> Result<T> + Send + 'static {
    move || {
        receiver
            .recv()
            .unwrap_or_else(|_| Err(worker_exited(stage)))
    }
}

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
        let (reply, receiver) = bounded(1);
        self.send(
            Stage::Upload,
            Op::Upload {
                storage: buffer.storage.clone(),
                offset,
                data: data.to_vec(),
                reply,
            },
        )?;
        let pending = PendingWork::deferred(deferred(Stage::Upload, receiver));
        match completion {
            Completion::Blocking => {
                pending.wait()?;
                Ok(PendingWork::ready())
            }
            Completion::Deferred => Ok(pending),
        }
    }
    fn download(
        &self,
        buffer: &Buffer,
        offset: usize,
        len: usize,
        completion: Completion,
    ) -> Result<PendingBytes> {
        let (reply, receiver) = bounded(1);
        self.send(
            Stage::Download,
            Op::Download {
                storage: buffer.storage.clone(),
                offset,
                len,
                reply,
            },
        )?;
        let pending = PendingBytes::deferred(deferred(Stage::Download, receiver));
        match completion {
            Completion::Blocking => Ok(PendingBytes::ready(pending.wait()?)),
            Completion::Deferred => Ok(pending),
        }
    }
    fn dispatch(&self, kernel: &Kernel, grid: &WorkGrid) -> Result<PendingWork> {
        let name = &kernel.module.kernels[kernel.index].name;
        let mut args = Vec::new();
        for (index, slot) in kernel.slots.lock().iter().enumerate() {
            match slot {
                Some(slot) => args.push(slot.clone()),
                None => {
                    return Err(Error::UnboundArgument {
                        kernel: name.clone(),
                        index,
                    })
                }
            }
        }
        let local = match grid.local() {
            Some(local) => *local,
            None => default_local_size(grid, &self.engine.info),
        };
        let grid = Grid {
            dims: grid.dims() as u32,
            global: *grid.global(),
            local,
        };
        log::trace!("sim dispatch `{name}` {grid:?}");
        let (reply, receiver) = bounded(1);
        self.send(
            Stage::Dispatch,
            Op::Dispatch {
                launch: Launch {
                    module: kernel.module.clone(),
                    kernel: kernel.index,
                    args,
                    grid,
                },
                reply,
            },
        )?;
        Ok(PendingWork::deferred(deferred(Stage::Dispatch, receiver)))
    }
    fn finish(&self, timeout: Option<Duration>) -> Result<()> {
        let (reply, receiver) = bounded(1);
        self.send(Stage::Drain, Op::Marker { reply })?;
        match timeout {
            None => receiver.recv().map_err(|_| worker_exited(Stage::Drain)),
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(()) => Ok(()),
                Err(RecvTimeoutError::Timeout) => {
                    self.hung.store(true, Ordering::Relaxed);
                    Err(Error::DeviceHang { timeout })
                }
                Err(RecvTimeoutError::Disconnected) => Err(worker_exited(Stage::Drain)),
            },
        }
    }
}

/// For each dimension the largest divisor of the global size that fits the
/// device limits.
fn default_local_size(grid: &WorkGrid, info: &DeviceInfo) -> [usize; 3] {
    let mut local = [1; 3];
    let mut remaining = info.max_work_group_size.max(1);
    for (dim, global) in grid.global().iter().enumerate().take(grid.dims()) {
        let limit = info
            .max_work_item_sizes
            .get(dim)
            .copied()
            .unwrap_or(1)
            .min(remaining)
            .max(1);
        let size = (1..=limit.min(*global))
            .rev()
            .find(|size| global % size == 0)
            .unwrap_or(1);
        local[dim] = size;
        remaining /= size;
    }
    local
}

fn run_worker(receiver: Receiver<Op>, latency: Duration) {
    for op in receiver.iter() {
        match op {
            Op::Upload {
                storage,
                offset,
                data,
                reply,
            } => {
                let mut bytes = storage.bytes.lock();
                let result = match bytes.get_mut(offset..offset + data.len()) {
                    Some(dst) => {
                        dst.copy_from_slice(&data);
                        Ok(())
                    }
                    None => Err(Error::SubmissionFailed {
                        stage: Stage::Upload,
                        code: CL_INVALID_VALUE,
                        message: "write exceeds the buffer".into(),
                    }),
                };
                reply.send(result).ok();
            }
            Op::Download {
                storage,
                offset,
                len,
                reply,
            } => {
                let bytes = storage.bytes.lock();
                let result = match bytes.get(offset..offset + len) {
                    Some(src) => Ok(src.to_vec()),
                    None => Err(Error::SubmissionFailed {
                        stage: Stage::Download,
                        code: CL_INVALID_VALUE,
                        message: "read exceeds the buffer".into(),
                    }),
                };
                reply.send(result).ok();
            }
            Op::Dispatch { launch, reply } => {
                std::thread::sleep(latency);
                reply.send(execute(launch)).ok();
            }
            Op::Marker { reply } => {
                reply.send(()).ok();
            }
        }
    }
}

fn execute(launch: Launch) -> Result<()> {
    let function = &launch.module.kernels[launch.kernel];
    let mut storages: Vec<Arc<Storage>> = Vec::new();
    let mut args = Vec::with_capacity(launch.args.len());
    for (param, slot) in function.params.iter().zip(&launch.args) {
        match slot {
            Slot::Buffer(storage) => {
                let index = match storages.iter().position(|s| Arc::ptr_eq(s, storage)) {
                    Some(index) => index,
                    None => {
                        storages.push(storage.clone());
                        storages.len() - 1
                    }
                };
                args.push(LaunchArg::Buffer(index));
            }
            Slot::Scalar(elem) => {
                let ty = match param.kind {
                    ParamDeclKind::Scalar { ty, .. } if ty.size() == elem.scalar_type().size() => ty,
                    _ => elem.scalar_type(),
                };
                args.push(LaunchArg::Scalar(interp::read_value(elem.as_bytes(), ty)));
            }
        }
    }
    let mut memory: Vec<Memory> = storages
        .iter()
        .map(|storage| Memory {
            bytes: std::mem::take(&mut *storage.bytes.lock()),
            writable: storage.access != AccessMode::ReadOnly,
        })
        .collect();
    let result = interp::run(function, &args, &mut memory, launch.grid);
    for (storage, memory) in storages.iter().zip(memory) {
        *storage.bytes.lock() = memory.bytes;
    }
    result.map_err(|fault| {
        let message = match fault.span {
            Some(span) => format!(
                "{SOURCE_LABEL}:{}:{}: `{}`: {}",
                span.line, span.col, function.name, fault.message
            ),
            None => format!("`{}`: {}", function.name, fault.message),
        };
        log::debug!("sim dispatch faulted: {message}");
        Error::SubmissionFailed {
            stage: Stage::Dispatch,
            code: CL_OUT_OF_RESOURCES,
            message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn engine() -> Arc<Engine> {
        Engine::new(0, &SimDevice::gpu())
    }

    #[test]
    fn diagnostics_are_rendered_with_a_caret() {
        let context = Engine::create_context(&engine()).unwrap();
        let source = "__kernel void f(__global int* x) {\n    x[0] = y;\n}\n";
        let (_, output) = context.compile(source).unwrap();
        assert!(!output.built);
        assert_eq!(
            output.log,
            "<kernel>:2:12: error: use of undeclared identifier 'y'\n    x[0] = y;\n           ^\n1 error generated.\n"
        );
    }

    #[test]
    fn deeply_nested_parentheses_fail_to_build() {
        let source = format!(
            "__kernel void f(__global int* x) {{ x[0] = {}1{}; }}",
            "(".repeat(10_000),
            ")".repeat(10_000),
        );
        // Same stack as the main thread.
        let output = std::thread::Builder::new()
            .stack_size(8 * 1024 * 1024)
            .spawn(move || {
                let context = Engine::create_context(&engine()).unwrap();
                context.compile(&source).unwrap().1
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(!output.built);
        assert!(
            output
                .log
                .contains("error: bracket nesting level exceeded maximum of 256"),
            "{}",
            &output.log[..200],
        );
        assert!(output.log.ends_with("1 error generated.\n"));
    }

    #[test]
    fn preferred_local_size_is_a_power_of_two() {
        let info = |max_work_group_size| DeviceInfo {
            index: 0,
            kind: DeviceKind::Gpu,
            name: String::new(),
            vendor: String::new(),
            max_compute_units: 1,
            max_work_item_dimensions: 3,
            max_work_item_sizes: vec![max_work_group_size; 3],
            max_work_group_size,
            global_mem_size: 0,
            local_mem_size: 0,
            max_mem_alloc_size: 0,
        };
        assert_eq!(preferred_local_size(&info(1024)), 64);
        assert_eq!(preferred_local_size(&info(48)), 32);
        assert_eq!(preferred_local_size(&info(1)), 1);
    }

    #[test]
    fn default_partition_divides_the_grid() {
        let info = engine().info.clone();
        let grid = WorkGrid::new(&[128], None).unwrap();
        assert_eq!(default_local_size(&grid, &info), [128, 1, 1]);
        let grid = WorkGrid::new(&[3000], None).unwrap();
        assert_eq!(default_local_size(&grid, &info), [1000, 1, 1]);
        let grid = WorkGrid::new(&[64, 64], None).unwrap();
        assert_eq!(default_local_size(&grid, &info), [64, 16, 1]);
    }

    #[test]
    fn allocations_are_accounted() {
        let engine = engine();
        let context = Engine::create_context(&engine).unwrap();
        let buffer = context.allocate(1024, AccessMode::ReadWrite).unwrap();
        assert_eq!(*engine.allocated.lock(), 1024);
        let too_large = engine.info.max_mem_alloc_size as usize + 1;
        assert_eq!(
            context.allocate(too_large, AccessMode::ReadWrite).err().unwrap().code(),
            Some(CL_INVALID_BUFFER_SIZE)
        );
        drop(buffer);
        assert_eq!(*engine.allocated.lock(), 0);
    }

    #[test]
    fn queue_executes_in_order() {
        let context = Engine::create_context(&engine()).unwrap();
        let queue = context.create_queue().unwrap();
        let buffer = context.allocate(8, AccessMode::ReadWrite).unwrap();
        let a = queue
            .upload(&buffer, 0, &[1; 8], Completion::Deferred)
            .unwrap();
        let b = queue
            .upload(&buffer, 4, &[2; 4], Completion::Deferred)
            .unwrap();
        let bytes = queue
            .download(&buffer, 0, 8, Completion::Blocking)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(bytes, [1, 1, 1, 1, 2, 2, 2, 2]);
        a.wait().unwrap();
        b.wait().unwrap();
        queue.finish(Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn released_queues_run_submitted_dispatches() {
        let engine = Engine::new(0, &SimDevice::gpu().with_latency(Duration::from_millis(50)));
        let context = Engine::create_context(&engine).unwrap();
        let queue = context.create_queue().unwrap();
        let (program, output) = context.compile(crate::kernels::CUBE_SOURCE).unwrap();
        assert!(output.built, "{}", output.log);
        let kernel = program.create_kernel("cube").unwrap();
        let buffer = context.allocate(16, AccessMode::ReadWrite).unwrap();
        let uploaded = queue
            .upload(
                &buffer,
                0,
                bytemuck::cast_slice(&[1i32, 2, 3, 4]),
                Completion::Deferred,
            )
            .unwrap();
        kernel.set_buffer(0, &buffer).unwrap();
        kernel.set_buffer(1, &buffer).unwrap();
        kernel.set_scalar(2, ScalarElem::U32(4)).unwrap();
        let grid = WorkGrid::new(&[4], None).unwrap();
        let dispatched = queue.dispatch(&kernel, &grid).unwrap();
        drop(queue);
        uploaded.wait().unwrap();
        dispatched.wait().unwrap();
        assert_eq!(
            *buffer.storage.bytes.lock(),
            bytemuck::cast_slice::<i32, u8>(&[1, 8, 27, 64])
        );
    }

    #[test]
    fn hung_queues_are_detached() {
        let engine = Engine::new(0, &SimDevice::gpu().with_latency(Duration::from_secs(5)));
        let context = Engine::create_context(&engine).unwrap();
        let queue = context.create_queue().unwrap();
        let (program, _) = context
            .compile("__kernel void nop() { }")
            .unwrap();
        let kernel = program.create_kernel("nop").unwrap();
        let grid = WorkGrid::new(&[1], None).unwrap();
        let _dispatched = queue.dispatch(&kernel, &grid).unwrap();
        let timeout = Duration::from_millis(20);
        assert_eq!(
            queue.finish(Some(timeout)).unwrap_err(),
            Error::DeviceHang { timeout }
        );
        let start = std::time::Instant::now();
        drop(queue);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
