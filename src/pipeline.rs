/*!
The accelerator pipeline.

A [`Pipeline`] runs a kernel of the form of [`cube`](crate::kernels::CUBE_SOURCE) end to end:
upload, bind, dispatch, drain, download and verify. Every resource is released in reverse
creation order, explicitly on success and by drop when a stage fails.

```
# use clpipe::{result::Result, pipeline::{Pipeline, PipelineConfig}, kernels::cube_reference};
# fn main() -> Result<()> {
let config = PipelineConfig::default();
let pipeline = Pipeline::new(config.select_device()?, config);
let input = [2, 5, 9];
let report = pipeline.run(&input, &cube_reference(&input))?;
assert_eq!(report.output(), [8, 125, 729]);
assert_eq!(report.summary(), "Computed '3/3' correct cubic values!");
# Ok(())
# }
```
*/

use crate::{
    buffer::{AccessMode, DeviceBuffer},
    context::ExecutionContext,
    device::{Backend, Device, DeviceKind, DeviceRegistry},
    dispatch::{Dispatcher, WorkGrid},
    error::Error,
    future::Completion,
    kernel::{KernelArg, KernelHandle},
    kernels::{CUBE_ENTRY, CUBE_SOURCE, DATA_SIZE},
    program::ProgramUnit,
    result::Result,
    verify::{Verification, Verifier},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

/** Pipeline configuration.

Defaults to the `cube` kernel on the first simulated GPU, with 128 elements, blocking
transfers, device partitioning and no drain timeout. */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    backend: Backend,
    kind: DeviceKind,
    source: String,
    entry: String,
    count: usize,
    local_size: Option<usize>,
    blocking: bool,
    drain_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            kind: DeviceKind::Gpu,
            source: CUBE_SOURCE.to_string(),
            entry: CUBE_ENTRY.to_string(),
            count: DATA_SIZE,
            local_size: None,
            blocking: true,
            drain_timeout: None,
        }
    }
}

impl PipelineConfig {
    /// Selects the backend.
    pub fn with_backend(self, backend: Backend) -> Self {
        Self { backend, ..self }
    }
    /// Selects the device class.
    pub fn with_kind(self, kind: DeviceKind) -> Self {
        Self { kind, ..self }
    }
    /// Replaces the kernel source.
    pub fn with_source(self, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..self
        }
    }
    /// Replaces the entry point.
    pub fn with_entry(self, entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            ..self
        }
    }
    /// The number of elements of [`random_input`](Self::random_input).
    pub fn with_count(self, count: usize) -> Self {
        Self { count, ..self }
    }
    /// Dispatches in work-groups of `local_size`, instead of device partitioning.
    pub fn with_local_size(self, local_size: Option<usize>) -> Self {
        Self { local_size, ..self }
    }
    /// Whether transfers and the dispatch block.
    pub fn with_blocking(self, blocking: bool) -> Self {
        Self { blocking, ..self }
    }
    /// Bounds the drain.
    pub fn with_drain_timeout(self, drain_timeout: Option<Duration>) -> Self {
        Self {
            drain_timeout,
            ..self
        }
    }
    /// The backend.
    pub fn backend(&self) -> Backend {
        self.backend
    }
    /// The device class.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
    /// The kernel source.
    pub fn source(&self) -> &str {
        &self.source
    }
    /// The entry point.
    pub fn entry(&self) -> &str {
        &self.entry
    }
    /// The number of elements.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The explicit local size.
    pub fn local_size(&self) -> Option<usize> {
        self.local_size
    }
    /// The completion of transfers and the dispatch.
    pub fn completion(&self) -> Completion {
        Completion::from_blocking(self.blocking)
    }
    /// The drain timeout.
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout
    }
    /// The first device of the configured class and backend.
    pub fn select_device(&self) -> Result<Device> {
        DeviceRegistry::new(self.backend)?.select_first(self.kind)
    }
    /// [`count`](Self::count) values in `[0, 100)` generated from `seed`.
    pub fn random_input(&self, seed: u64) -> Vec<i32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..self.count).map(|_| rng.gen_range(0..100)).collect()
    }
}

/// The outcome of a [`Pipeline::run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineReport {
    grid: WorkGrid,
    preferred_local_size: usize,
    output: Vec<i32>,
    verification: Verification,
}

impl PipelineReport {
    /// The grid of the dispatch.
    pub fn grid(&self) -> &WorkGrid {
        &self.grid
    }
    /// The work-group size suggested for the kernel, which was not used.
    pub fn preferred_local_size(&self) -> usize {
        self.preferred_local_size
    }
    /// The device results.
    pub fn output(&self) -> &[i32] {
        &self.output
    }
    /// The comparison of the output with the reference.
    pub fn verification(&self) -> &Verification {
        &self.verification
    }
    /// `Computed 'X/Y' correct cubic values!`
    pub fn summary(&self) -> String {
        format!(
            "Computed '{}/{}' correct cubic values!",
            self.verification.match_count(),
            self.verification.total()
        )
    }
}

/// Runs a kernel on a device.
#[derive(Debug)]
pub struct Pipeline {
    device: Device,
    config: PipelineConfig,
}

impl Pipeline {
    /// A pipeline running `config` on `device`.
    ///
    /// The backend and class of `config` are only used by
    /// [`select_device`](PipelineConfig::select_device).
    pub fn new(device: Device, config: PipelineConfig) -> Self {
        Self { device, config }
    }
    /// The device.
    pub fn device(&self) -> &Device {
        &self.device
    }
    /// The configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
    /** Runs the kernel over `input` and compares the output with `reference`.

    The entry point must take an input buffer, an output buffer and the element count as
    an `unsigned int`.

    **errors**
    The first failing stage aborts the run, see [`Error::stage`]. An empty `input` is an
    [`InvalidGridConfiguration`](Error::InvalidGridConfiguration). */
    pub fn run(&self, input: &[i32], reference: &[i32]) -> Result<PipelineReport> {
        let count = input.len();
        if count == 0 {
            return Err(Error::InvalidGridConfiguration {
                reason: "element count is zero".into(),
            });
        }
        let count_arg = u32::try_from(count).map_err(|_| Error::InvalidGridConfiguration {
            reason: format!("element count {count} exceeds the range of the count argument"),
        })?;
        let config = &self.config;
        let completion = config.completion();

        log::info!("creating context on {:?}", self.device);
        let mut builder = ExecutionContext::builder(&self.device);
        if let Some(timeout) = config.drain_timeout {
            builder = builder.drain_timeout(timeout);
        }
        let context = builder.build()?;

        log::info!("building program");
        let program = ProgramUnit::build(&context, &config.source)?;
        let mut kernel = KernelHandle::resolve(&program, &config.entry)?;
        let preferred_local_size = kernel.query_preferred_local_size(&self.device)?;
        log::info!("preferred local size {preferred_local_size} (unused)");

        log::info!("allocating {count} elements");
        let input_buffer = DeviceBuffer::allocate_for::<i32>(&context, count, AccessMode::ReadOnly)?;
        let output_buffer =
            DeviceBuffer::allocate_for::<i32>(&context, count, AccessMode::WriteOnly)?;

        log::info!("uploading input");
        let uploaded = input_buffer.upload_from(input, 0, completion)?;

        kernel.bind_argument(0, KernelArg::Buffer(&input_buffer))?;
        kernel.bind_argument(1, KernelArg::Buffer(&output_buffer))?;
        kernel.bind_argument(2, KernelArg::scalar(count_arg))?;

        let grid = match config.local_size {
            Some(local_size) => {
                Dispatcher::compute_grid_with_local(count, local_size, &self.device)?
            }
            None => Dispatcher::compute_grid(count, &self.device)?,
        };
        log::info!("dispatching {grid}");
        let dispatched = Dispatcher::submit(&context, &kernel, &grid, completion)?;

        log::info!("draining");
        context.drain()?;
        uploaded.wait()?;
        dispatched.wait()?;

        log::info!("downloading output");
        let mut output = vec![0; count];
        output_buffer
            .download_to(&mut output, 0, Completion::Blocking)?
            .wait()?;

        let verification = Verifier::compare(reference, &output)?;
        log::info!("verified {verification}");

        output_buffer.release()?;
        input_buffer.release()?;
        kernel.release()?;
        program.release()?;
        context.release()?;

        Ok(PipelineReport {
            grid,
            preferred_local_size,
            output,
            verification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::cube_reference;

    fn pipeline(config: PipelineConfig) -> Pipeline {
        Pipeline::new(config.select_device().unwrap(), config)
    }

    #[test]
    fn cube() {
        let pipeline = pipeline(PipelineConfig::default());
        let input = pipeline.config().random_input(0);
        assert_eq!(input.len(), DATA_SIZE);
        assert!(input.iter().all(|x| (0..100).contains(x)));
        let report = pipeline.run(&input, &cube_reference(&input)).unwrap();
        assert!(report.verification().is_exact());
        assert_eq!(report.grid().global_size(), [DATA_SIZE]);
        assert_eq!(report.grid().local_size(), None);
        assert_eq!(report.preferred_local_size(), 64);
    }

    #[test]
    fn deferred_with_local_size() {
        let pipeline = pipeline(
            PipelineConfig::default()
                .with_kind(DeviceKind::Cpu)
                .with_blocking(false)
                .with_local_size(Some(4))
                .with_drain_timeout(Some(Duration::from_secs(10))),
        );
        let input = [2, 5, 9, 1, 0, 3, 4, 7];
        let report = pipeline.run(&input, &cube_reference(&input)).unwrap();
        assert_eq!(report.output(), [8, 125, 729, 1, 0, 27, 64, 343]);
        assert_eq!(report.grid().local_size(), Some(&[4][..]));
    }

    #[test]
    fn mismatches_are_reported() {
        let pipeline = pipeline(PipelineConfig::default());
        let report = pipeline.run(&[2, 5, 9], &[8, 125, 0]).unwrap();
        assert_eq!(report.summary(), "Computed '2/3' correct cubic values!");
    }

    #[test]
    fn empty_input() {
        let pipeline = pipeline(PipelineConfig::default());
        assert!(matches!(
            pipeline.run(&[], &[]),
            Err(Error::InvalidGridConfiguration { .. })
        ));
    }

    #[test]
    fn random_input_is_seeded() {
        let config = PipelineConfig::default().with_count(16);
        assert_eq!(config.random_input(7), config.random_input(7));
        assert_ne!(config.random_input(7), config.random_input(8));
    }
}
