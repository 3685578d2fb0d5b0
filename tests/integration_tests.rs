use anyhow::{ensure, Result};
use clpipe::{
    buffer::{AccessMode, DeviceBuffer, Direction},
    context::{ExecutionContext, Resource},
    device::{Backend, Device, DeviceKind, DeviceRegistry, SimDevice},
    dispatch::{Dispatcher, WorkGrid},
    error::{codes, Error, Stage},
    future::Completion,
    kernel::{KernelArg, KernelHandle},
    kernels::{cube_reference, CUBE_ENTRY, CUBE_SOURCE},
    pipeline::{Pipeline, PipelineConfig},
    program::ProgramUnit,
    verify::Verifier,
};
use libtest_mimic::{Arguments, Trial};
use std::time::{Duration, Instant};

fn main() {
    env_logger::builder().is_test(true).try_init().ok();
    let args = Arguments::from_args();
    let mut devices = vec![DeviceRegistry::new(Backend::Sim)
        .unwrap()
        .select_first(DeviceKind::Gpu)
        .unwrap()];
    if cfg!(feature = "device") {
        match DeviceRegistry::new(Backend::OpenCl).and_then(|x| x.select_first(DeviceKind::Gpu)) {
            Ok(device) => {
                println!("testing {}", device.info().name());
                devices.push(device);
            }
            Err(e) => println!("no opencl device: {e}"),
        }
    }
    let tests = devices
        .iter()
        .flat_map(device_tests)
        .chain(sim_tests())
        .collect();
    libtest_mimic::run(&args, tests).exit()
}

fn device_test(device: &Device, name: &str, f: fn(Device) -> Result<()>) -> Trial {
    let name = format!("{name}_{}", device.backend());
    let device = device.clone();
    Trial::test(name, move || Ok(f(device)?))
}

fn device_tests(device: &Device) -> Vec<Trial> {
    vec![
        device_test(device, "cube_pipeline", cube_pipeline),
        device_test(device, "end_to_end", end_to_end),
        device_test(device, "deferred_pipeline", deferred_pipeline),
        device_test(device, "explicit_local_size", explicit_local_size),
        device_test(device, "buffer_round_trip", buffer_round_trip),
        device_test(device, "read_only_download", read_only_download),
        device_test(device, "build_failure", build_failure),
        device_test(device, "release_order", release_order),
        device_test(device, "drop_order", drop_order),
        device_test(device, "context_outlives_dependents", context_outlives_dependents),
        device_test(device, "grid_divisibility", grid_divisibility),
        device_test(device, "unbound_argument", unbound_argument),
    ]
}

fn sim_tests() -> Vec<Trial> {
    vec![
        Trial::test("device_hang_sim", || Ok(device_hang()?)),
        Trial::test("release_completes_submitted_work_sim", || {
            Ok(release_completes_submitted_work()?)
        }),
        Trial::test("context_failure_sim", || Ok(context_failure()?)),
        Trial::test("queue_failure_sim", || Ok(queue_failure()?)),
        Trial::test("allocation_failed_sim", || Ok(allocation_failed()?)),
        Trial::test("no_device_found_sim", || Ok(no_device_found()?)),
        Trial::test("dispatch_fault_sim", || Ok(dispatch_fault()?)),
    ]
}

fn sim_device(sim: SimDevice) -> Result<Device> {
    Ok(DeviceRegistry::builder()
        .sim_devices([sim])
        .build()?
        .select_first(DeviceKind::All)?)
}

fn cube_pipeline(device: Device) -> Result<()> {
    let config = PipelineConfig::default();
    let input = config.random_input(0);
    let report = Pipeline::new(device, config).run(&input, &cube_reference(&input))?;
    let verification = report.verification();
    ensure!(verification.match_count() == input.len());
    ensure!(verification.total() == input.len());
    Ok(())
}

fn end_to_end(device: Device) -> Result<()> {
    let report = Pipeline::new(device, PipelineConfig::default()).run(&[2, 5, 9], &[8, 125, 729])?;
    assert_eq!(report.output(), [8, 125, 729]);
    assert_eq!(report.summary(), "Computed '3/3' correct cubic values!");
    Ok(())
}

fn deferred_pipeline(device: Device) -> Result<()> {
    let config = PipelineConfig::default()
        .with_blocking(false)
        .with_count(1000);
    let input = config.random_input(1);
    let report = Pipeline::new(device, config).run(&input, &cube_reference(&input))?;
    ensure!(report.verification().is_exact());
    Ok(())
}

fn explicit_local_size(device: Device) -> Result<()> {
    let config = PipelineConfig::default().with_local_size(Some(16));
    let input = config.random_input(2);
    let report = Pipeline::new(device.clone(), config).run(&input, &cube_reference(&input))?;
    assert_eq!(report.grid().local_size(), Some(&[16][..]));
    ensure!(report.verification().is_exact());
    let config = PipelineConfig::default().with_local_size(Some(3));
    let error = Pipeline::new(device, config)
        .run(&input, &cube_reference(&input))
        .unwrap_err();
    assert!(matches!(error, Error::InvalidGridConfiguration { .. }));
    Ok(())
}

fn buffer_round_trip(device: Device) -> Result<()> {
    let context = ExecutionContext::create(&device)?;
    let data: Vec<i32> = (-50..50).collect();
    for access in [AccessMode::ReadWrite, AccessMode::WriteOnly] {
        let buffer = DeviceBuffer::allocate_for::<i32>(&context, data.len(), access)?;
        buffer.upload_from(&data, 0, Completion::Blocking)?.wait()?;
        let mut host = vec![0; data.len()];
        buffer
            .download_to(&mut host, 0, Completion::Blocking)?
            .wait()?;
        assert_eq!(host, data);
        buffer.release()?;
    }
    context.release()?;
    Ok(())
}

fn read_only_download(device: Device) -> Result<()> {
    let context = ExecutionContext::create(&device)?;
    let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadOnly)?;
    buffer.upload_from(&[1, 2, 3, 4], 0, Completion::Blocking)?.wait()?;
    let mut host = [0; 4];
    for completion in [Completion::Blocking, Completion::Deferred] {
        assert_eq!(
            buffer.download_to(&mut host, 0, completion).unwrap_err(),
            Error::AccessModeViolation {
                access: AccessMode::ReadOnly,
                direction: Direction::Download,
            }
        );
    }
    buffer.release()?;
    context.release()?;
    Ok(())
}

fn build_failure(device: Device) -> Result<()> {
    let context = ExecutionContext::create(&device)?;
    let source = "__kernel void cube(__global int* input { output[0] = 1; }";
    let error = ProgramUnit::build(&context, source).unwrap_err();
    assert_eq!(error.stage(), Stage::Build);
    ensure!(!error.build_log().unwrap_or_default().is_empty());
    let program = ProgramUnit::compile(&context, source)?;
    assert_eq!(
        KernelHandle::resolve(&program, CUBE_ENTRY).unwrap_err(),
        Error::ProgramNotBuilt
    );
    program.release()?;
    context.release()?;
    Ok(())
}

fn release_order(device: Device) -> Result<()> {
    let context = ExecutionContext::create(&device)?;
    let log = context.lifecycle();
    let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
    let kernel = KernelHandle::resolve(&program, CUBE_ENTRY)?;
    let input = DeviceBuffer::allocate_for::<i32>(&context, 8, AccessMode::ReadOnly)?;
    let output = DeviceBuffer::allocate_for::<i32>(&context, 8, AccessMode::WriteOnly)?;
    output.release()?;
    input.release()?;
    kernel.release()?;
    program.release()?;
    context.release()?;
    let mut released = log.released();
    released.reverse();
    assert_eq!(log.created(), released);
    assert_eq!(
        log.created()
            .into_iter()
            .map(|(resource, _)| resource)
            .collect::<Vec<_>>(),
        [
            Resource::Context,
            Resource::Queue,
            Resource::Program,
            Resource::Kernel,
            Resource::Buffer,
            Resource::Buffer,
        ]
    );
    Ok(())
}

fn drop_order(device: Device) -> Result<()> {
    let log = {
        let context = ExecutionContext::create(&device)?;
        let log = context.lifecycle();
        let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
        let _kernel = KernelHandle::resolve(&program, CUBE_ENTRY)?;
        let _buffer = DeviceBuffer::allocate(&context, 64, AccessMode::ReadWrite)?;
        log
    };
    let mut released = log.released();
    released.reverse();
    assert_eq!(log.created(), released);
    Ok(())
}

fn context_outlives_dependents(device: Device) -> Result<()> {
    let context = ExecutionContext::create(&device)?;
    let log = context.lifecycle();
    let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
    let mut kernel = KernelHandle::resolve(&program, CUBE_ENTRY)?;
    let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadWrite)?;
    program.release()?;
    // kernels outlive their program
    kernel.bind_argument(0, &buffer)?;
    assert_eq!(
        context.release().unwrap_err(),
        Error::ContextInUse { dependents: 2 }
    );
    assert_eq!(log.released().len(), 1);
    kernel.bind_argument(1, &buffer)?;
    buffer.upload_from(&[1, 2, 3, 4], 0, Completion::Blocking)?.wait()?;
    let mut host = [0; 4];
    buffer
        .download_to(&mut host, 0, Completion::Blocking)?
        .wait()?;
    assert_eq!(host, [1, 2, 3, 4]);
    kernel.release()?;
    buffer.release()?;
    let released: Vec<Resource> = log
        .released()
        .into_iter()
        .map(|(resource, _)| resource)
        .collect();
    assert_eq!(
        released,
        [
            Resource::Program,
            Resource::Kernel,
            Resource::Buffer,
            Resource::Queue,
            Resource::Context,
        ]
    );
    Ok(())
}

fn grid_divisibility(device: Device) -> Result<()> {
    assert!(matches!(
        Dispatcher::compute_grid_with_local(10, 3, &device),
        Err(Error::InvalidGridConfiguration { .. })
    ));
    let grid = Dispatcher::compute_grid_with_local(12, 4, &device)?;
    assert_eq!(grid, WorkGrid::new(&[12], Some(&[4]))?);
    let grid = Dispatcher::compute_grid(12, &device)?;
    assert_eq!(grid.local(), None);
    Ok(())
}

fn unbound_argument(device: Device) -> Result<()> {
    let context = ExecutionContext::create(&device)?;
    let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
    let mut kernel = KernelHandle::resolve(&program, CUBE_ENTRY)?;
    let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadWrite)?;
    kernel.bind_argument(0, &buffer)?;
    kernel.bind_argument(2, KernelArg::scalar(4u32))?;
    let grid = Dispatcher::compute_grid(4, &device)?;
    assert_eq!(
        Dispatcher::submit(&context, &kernel, &grid, Completion::Blocking).unwrap_err(),
        Error::UnboundArgument {
            kernel: CUBE_ENTRY.into(),
            index: 1,
        }
    );
    // rebinding overwrites
    kernel.bind_argument(1, &buffer)?;
    buffer.upload_from(&[1, 2, 3, 4], 0, Completion::Blocking)?.wait()?;
    Dispatcher::submit(&context, &kernel, &grid, Completion::Blocking)?.wait()?;
    let mut host = [0; 4];
    buffer
        .download_to(&mut host, 0, Completion::Blocking)?
        .wait()?;
    assert_eq!(host, [1, 8, 27, 64]);
    Ok(())
}

fn device_hang() -> Result<()> {
    let device = sim_device(SimDevice::gpu().with_latency(Duration::from_secs(5)))?;
    let timeout = Duration::from_millis(50);
    let context = ExecutionContext::builder(&device)
        .drain_timeout(timeout)
        .build()?;
    let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
    let mut kernel = KernelHandle::resolve(&program, CUBE_ENTRY)?;
    let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadWrite)?;
    kernel.bind_argument(0, &buffer)?;
    kernel.bind_argument(1, &buffer)?;
    kernel.bind_argument(2, KernelArg::scalar(4u32))?;
    let grid = Dispatcher::compute_grid(4, &device)?;
    let _pending = Dispatcher::submit(&context, &kernel, &grid, Completion::Deferred)?;
    let error = context.drain().unwrap_err();
    assert_eq!(error, Error::DeviceHang { timeout });
    assert_eq!(error.stage(), Stage::Drain);
    // a hung queue is detached, releasing does not wait for it
    let start = Instant::now();
    buffer.release()?;
    kernel.release()?;
    program.release()?;
    context.release()?;
    ensure!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    Ok(())
}

fn release_completes_submitted_work() -> Result<()> {
    let device = sim_device(SimDevice::gpu().with_latency(Duration::from_millis(100)))?;
    let context = ExecutionContext::create(&device)?;
    let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
    let mut kernel = KernelHandle::resolve(&program, CUBE_ENTRY)?;
    let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadWrite)?;
    buffer.upload_from(&[2, 3, 4, 5], 0, Completion::Blocking)?.wait()?;
    kernel.bind_argument(0, &buffer)?;
    kernel.bind_argument(1, &buffer)?;
    kernel.bind_argument(2, KernelArg::scalar(4u32))?;
    let grid = Dispatcher::compute_grid(4, &device)?;
    let first = Dispatcher::submit(&context, &kernel, &grid, Completion::Deferred)?;
    // detaching the context does not cancel the dispatch
    assert!(matches!(
        context.release(),
        Err(Error::ContextInUse { .. })
    ));
    first.wait()?;
    let mut host = [0; 4];
    buffer
        .download_to(&mut host, 0, Completion::Blocking)?
        .wait()?;
    assert_eq!(host, [8, 27, 64, 125]);
    kernel.release()?;
    program.release()?;
    buffer.release()?;

    let context = ExecutionContext::create(&device)?;
    let program = ProgramUnit::build(&context, CUBE_SOURCE)?;
    let mut kernel = KernelHandle::resolve(&program, CUBE_ENTRY)?;
    let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadWrite)?;
    kernel.bind_argument(0, &buffer)?;
    kernel.bind_argument(1, &buffer)?;
    kernel.bind_argument(2, KernelArg::scalar(4u32))?;
    let second = Dispatcher::submit(&context, &kernel, &grid, Completion::Deferred)?;
    buffer.release()?;
    kernel.release()?;
    program.release()?;
    context.release()?;
    // the queue ran the dispatch before it was released
    second.wait()?;
    Ok(())
}

fn context_failure() -> Result<()> {
    let device =
        sim_device(SimDevice::gpu().with_context_failure(codes::CL_DEVICE_NOT_AVAILABLE))?;
    let error = ExecutionContext::create(&device).unwrap_err();
    assert_eq!(error.stage(), Stage::Context);
    assert_eq!(error.code(), Some(codes::CL_DEVICE_NOT_AVAILABLE));
    let error = Pipeline::new(device, PipelineConfig::default())
        .run(&[1], &[1])
        .unwrap_err();
    assert!(matches!(error, Error::ContextCreationFailed { .. }));
    Ok(())
}

fn queue_failure() -> Result<()> {
    let device = sim_device(SimDevice::cpu().with_queue_failure(codes::CL_OUT_OF_RESOURCES))?;
    assert_eq!(
        ExecutionContext::create(&device).unwrap_err(),
        Error::QueueCreationFailed {
            code: codes::CL_OUT_OF_RESOURCES
        }
    );
    Ok(())
}

fn allocation_failed() -> Result<()> {
    let device = sim_device(SimDevice::gpu().with_global_mem_size(1 << 10))?;
    let config = PipelineConfig::default().with_count(1000);
    let input = config.random_input(0);
    let error = Pipeline::new(device, config)
        .run(&input, &cube_reference(&input))
        .unwrap_err();
    assert_eq!(error.stage(), Stage::Allocation);
    Ok(())
}

fn no_device_found() -> Result<()> {
    let registry = DeviceRegistry::builder()
        .sim_devices([SimDevice::cpu()])
        .build()?;
    assert_eq!(
        registry.select_first(DeviceKind::Gpu).unwrap_err(),
        Error::NoDeviceFound {
            kind: DeviceKind::Gpu
        }
    );
    let error = PipelineConfig::default()
        .with_kind(DeviceKind::Accelerator)
        .select_device()
        .unwrap_err();
    assert_eq!(error.stage(), Stage::Discovery);
    Ok(())
}

fn dispatch_fault() -> Result<()> {
    let device = sim_device(SimDevice::gpu())?;
    let context = ExecutionContext::create(&device)?;
    let program = ProgramUnit::build(
        &context,
        "__kernel void shift(__global int* x) { x[get_global_id(0) + 1] = 1; }",
    )?;
    let mut kernel = KernelHandle::resolve(&program, "shift")?;
    let buffer = DeviceBuffer::allocate_for::<i32>(&context, 4, AccessMode::ReadWrite)?;
    kernel.bind_argument(0, &buffer)?;
    let grid = Dispatcher::compute_grid(4, &device)?;
    let pending = Dispatcher::submit(&context, &kernel, &grid, Completion::Deferred)?;
    context.drain()?;
    match pending.wait().unwrap_err() {
        Error::SubmissionFailed {
            stage: Stage::Dispatch,
            message,
            ..
        } => ensure!(message.contains("out of bounds"), "{message}"),
        error => anyhow::bail!("unexpected {error}"),
    }
    let verification = Verifier::compare(&[0, 1, 1, 1], &{
        let mut host = [0; 4];
        buffer
            .download_to(&mut host, 0, Completion::Blocking)?
            .wait()?;
        host
    })?;
    ensure!(verification.total() == 4);
    Ok(())
}
