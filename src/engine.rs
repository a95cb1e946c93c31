//! The engine: one owner for state, backends, output buffers and timing.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendDescriptor, BackendRegistry},
    colors::{packed_to_bgr, triplets_to_bgr},
    config::EngineConfig,
    error::EngineError,
    fractals::Grid,
    state::{Applied, ConfigEvent, EngineState},
    strategies::{KernelJob, Strategy},
    timing::{FileTimingSink, TimingHarness, TimingSink},
};

/// Read-only view of the buffer the active strategy produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Output<'a> {
    /// `0x00RRGGBB` per cell at `x * height + y`.
    Packed(&'a [u32]),
    /// `[B, G << 8, R << 16]` per cell.
    Triplets(&'a [u32]),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    Packed,
    Tiled,
    Triplets,
}

/// Host copies of the device outputs, one set per strategy. Each is sized on
/// first use and then overwritten in place by every invocation that targets
/// it.
#[derive(Default)]
pub struct FrameBuffers {
    image: Vec<u32>,
    triplets: Vec<u32>,
    tiled_image: Vec<u32>,
    scatter: Vec<u32>,
    texture: Vec<u8>,
    layout: Option<Layout>,
    texture_stale: bool,
}

fn sized(buffer: &mut Vec<u32>, len: usize) -> &mut [u32] {
    if buffer.len() != len {
        *buffer = vec![0; len];
    }
    buffer
}

impl FrameBuffers {
    fn mark(&mut self, strategy: Strategy) {
        self.layout = Some(match strategy {
            Strategy::Packed => Layout::Packed,
            Strategy::Channel => Layout::Triplets,
            Strategy::Tiled => Layout::Tiled,
        });
        self.texture_stale = true;
    }

    fn texture(&mut self, grid: Grid) -> &[u8] {
        if self.texture_stale {
            self.texture.resize(grid.cells() * 3, 0);
            match self.layout {
                Some(Layout::Packed) => packed_to_bgr(&self.image, grid, &mut self.texture),
                Some(Layout::Tiled) => packed_to_bgr(&self.tiled_image, grid, &mut self.texture),
                Some(Layout::Triplets) => triplets_to_bgr(&self.triplets, grid, &mut self.texture),
                None => {}
            }
            self.texture_stale = false;
        }
        &self.texture
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Applied(Applied),
    Rejected { event: ConfigEvent, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputeReport {
    pub strategy: Strategy,
    pub backend: String,
    pub elapsed: Duration,
}

/// What one frame step did.
#[derive(Debug)]
pub struct FrameReport {
    pub outcomes: Vec<EventOutcome>,
    /// `None` when nothing asked for a compute.
    pub computed: Option<Result<ComputeReport, EngineError>>,
}

pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    registry: BackendRegistry,
    timing: TimingHarness,
    buffers: FrameBuffers,
    compute_requested: bool,
}

fn log_descriptor(index: usize, descriptor: &BackendDescriptor) {
    info!(
        id = %descriptor.id,
        dedicated_memory_mb = descriptor.dedicated_memory_bytes as f64 / (1024.0 * 1024.0),
        has_display = descriptor.has_display,
        is_debug = descriptor.is_debug,
        is_emulated = descriptor.is_emulated,
        supports_double_precision = descriptor.supports_double_precision,
        "backend {} = {}",
        index + 1,
        descriptor.description
    );
    if descriptor.is_emulated {
        warn!(
            "backend {} is a very slow emulator, only use it for debugging",
            index + 1
        );
    }
}

impl Engine {
    /// Validates `config`, discovers backends and selects `config.backend`.
    pub fn new(
        config: EngineConfig,
        registry: BackendRegistry,
        sink: Box<dyn TimingSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let mut engine = Engine {
            state: EngineState::from_config(&config),
            config,
            registry,
            timing: TimingHarness::new(sink),
            buffers: FrameBuffers::default(),
            compute_requested: false,
        };

        let descriptors = engine.registry.enumerate().to_vec();
        if descriptors.is_empty() {
            warn!("{}", EngineError::BackendUnavailable);
            return Ok(engine);
        }
        for (index, descriptor) in descriptors.iter().enumerate() {
            log_descriptor(index, descriptor);
        }

        let wanted = engine.config.backend;
        if wanted >= descriptors.len() {
            warn!(
                wanted,
                count = descriptors.len(),
                "configured backend out of range, keeping backend 1"
            );
        }
        engine.registry.select(wanted);
        let job = engine.job();
        engine.registry.active()?.check_job(&job)?;
        Ok(engine)
    }

    /// Default backends with timing logs written under `config.timing_dir`.
    pub fn with_defaults(config: EngineConfig) -> Result<Self, EngineError> {
        let registry = BackendRegistry::with_defaults(&config);
        let sink = Box::new(FileTimingSink::from_config(&config));
        Self::new(config, registry, sink)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// The job the next compute would dispatch.
    pub fn job(&self) -> KernelJob {
        KernelJob {
            domain: self.config.domain,
            grid: self.config.grid(),
            max_iterations: self.state.max_iterations,
            bias: self.state.bias,
            tile_edge: self.config.tile_edge,
            scatter: self.config.tile_scatter,
        }
    }

    fn reject(event: ConfigEvent, reason: impl Into<String>) -> EventOutcome {
        let reason = reason.into();
        warn!(%event, "{reason}");
        EventOutcome::Rejected { event, reason }
    }

    fn select_backend(&mut self, event: ConfigEvent, index: usize) -> EventOutcome {
        let count = self.registry.len();
        if index >= count {
            let reason = EngineError::BackendIndex { index, count }.to_string();
            return Self::reject(event, reason);
        }
        let job = self.job();
        let previous = self.registry.selected();
        self.registry.select(index);
        let active = self.registry.active();
        let checked = active.and_then(|backend| backend.check_job(&job));
        if let Err(e) = checked {
            self.registry.select(previous);
            return Self::reject(event, e.to_string());
        }
        let descriptor = &self.registry.descriptors()[index];
        info!("using backend {} = {}", index + 1, descriptor.description);
        if descriptor.is_emulated {
            warn!("very slow emulator selected, only use it for debugging");
        }
        EventOutcome::Applied(Applied::SelectBackend(index))
    }

    /// Applies one configuration event between frames.
    pub fn apply(&mut self, event: ConfigEvent) -> EventOutcome {
        if let ConfigEvent::SelectStrategy(Strategy::Channel) = event {
            if let Err(e) = self.config.grid().check_square() {
                return Self::reject(event, e.to_string());
            }
        }
        let applied = self.state.apply(event);
        match applied {
            Applied::SelectBackend(index) => return self.select_backend(event, index),
            Applied::Iterations(n) => info!("iterations: {n}"),
            Applied::Nudged(channel, value) => info!("{channel:?}: {value}"),
            Applied::Dump(snapshot) => info!("{snapshot}"),
            Applied::TimingStarted => info!("calculating {} shots", self.state.timing.shots),
            Applied::ComputeOnce => info!("calculating once"),
            Applied::StrategySelected(strategy) => info!("displaying {strategy}"),
            Applied::Recompute | Applied::TimeOnce => debug!(%event, "state changed"),
        }
        if applied.requests_compute() {
            self.compute_requested = true;
        }
        EventOutcome::Applied(applied)
    }

    /// Runs the active strategy on the selected backend and blocks until its
    /// output is in host memory. On failure the previous output is kept.
    #[tracing::instrument(level = "debug", skip(self), fields(strategy = %self.state.strategy))]
    pub fn compute(&mut self) -> Result<ComputeReport, EngineError> {
        let job = self.job();
        let strategy = self.state.strategy;
        let cells = job.grid.cells();
        let Engine {
            registry,
            state,
            timing,
            buffers,
            ..
        } = self;

        let backend = registry.active()?;
        let descriptor = backend.descriptor().clone();
        if descriptor.is_emulated {
            debug!("calculating on the emulated backend");
        }
        let elapsed = timing.measure(&mut state.timing, strategy, &descriptor, job.tile_edge, || {
            match strategy {
                Strategy::Packed => backend.packed(&job, sized(&mut buffers.image, cells)),
                Strategy::Channel => backend.channel(&job, sized(&mut buffers.triplets, cells * 3)),
                Strategy::Tiled => {
                    let image = sized(&mut buffers.tiled_image, cells);
                    backend.tiled(&job, image, &mut buffers.scatter)
                }
            }
        })?;
        buffers.mark(strategy);
        if state.timing.is_active() {
            debug!(remaining = state.timing.remaining, "timing shot recorded");
        }
        Ok(ComputeReport {
            strategy,
            backend: descriptor.id,
            elapsed,
        })
    }

    /// One frame: applies `events` in order, then computes if an event asked
    /// for it or timing is running. Compute failures are logged and returned
    /// in the report; the engine keeps accepting frames.
    pub fn update<I>(&mut self, events: I) -> FrameReport
    where
        I: IntoIterator<Item = ConfigEvent>,
    {
        let outcomes: Vec<EventOutcome> = events.into_iter().map(|e| self.apply(e)).collect();
        let wanted = std::mem::take(&mut self.compute_requested) || self.state.timing.is_active();
        let computed = if !wanted {
            None
        } else if self.registry.is_empty() {
            warn!("{}, nothing computed", EngineError::BackendUnavailable);
            None
        } else {
            let result = self.compute();
            if let Err(e) = &result {
                error!("compute failed: {e}");
            }
            Some(result)
        };
        FrameReport { outcomes, computed }
    }

    /// The buffer written by the active strategy's last successful run.
    pub fn output(&self) -> Output<'_> {
        match self.state.strategy {
            Strategy::Packed => Output::Packed(&self.buffers.image),
            Strategy::Channel => Output::Triplets(&self.buffers.triplets),
            Strategy::Tiled => Output::Packed(&self.buffers.tiled_image),
        }
    }

    /// Flat output of the last tiled run.
    pub fn tile_scatter(&self) -> &[u32] {
        &self.buffers.scatter
    }

    /// B,G,R texture of the last successful compute, rebuilt on demand.
    pub fn texture(&mut self) -> &[u8] {
        let grid = self.config.grid();
        self.buffers.texture(grid)
    }
}
