//! Wall-clock measurement of strategy invocations and the logs they go to.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{LineWriter, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{error, info};

use crate::{
    backend::BackendDescriptor, config::expand_timing_template, config::EngineConfig,
    error::EngineError, strategies::Strategy,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimingMode {
    /// Invocations still run; elapsed time goes to the log instead of a sink.
    #[default]
    Off,
    SingleShot,
    Loop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingState {
    pub mode: TimingMode,
    /// Length of one loop.
    pub shots: u32,
    pub remaining: u32,
}

impl TimingState {
    pub fn new(shots: u32) -> Self {
        TimingState {
            mode: TimingMode::Off,
            shots,
            remaining: 0,
        }
    }

    pub fn start_loop(&mut self) {
        self.mode = TimingMode::Loop;
        self.remaining = self.shots;
    }

    /// Measures the next invocation unless a loop is already running.
    pub fn single_shot(&mut self) {
        if self.mode == TimingMode::Off {
            self.mode = TimingMode::SingleShot;
        }
    }

    pub fn is_active(&self) -> bool {
        self.mode != TimingMode::Off
    }

    /// Consumes one shot, switching off when the mode is exhausted.
    fn consume(&mut self) {
        match self.mode {
            TimingMode::Off => {}
            TimingMode::SingleShot => self.mode = TimingMode::Off,
            TimingMode::Loop => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining == 0 {
                    self.mode = TimingMode::Off;
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Measurement {
    pub strategy: Strategy,
    pub backend_id: String,
    pub backend_description: String,
    pub tile_edge: usize,
    pub elapsed_ms: u128,
}

/// Where measured invocations are appended, one stream per
/// (strategy, backend) pair.
pub trait TimingSink: Send {
    fn record(&mut self, measurement: &Measurement) -> Result<(), EngineError>;
}

/// Appends one millisecond count per line to a file per (strategy, backend).
/// The first write to a file in this process is preceded by a header naming
/// the backend and the tile edge.
pub struct FileTimingSink {
    dir: PathBuf,
    template: String,
    streams: HashMap<(Strategy, String), LineWriter<File>>,
}

impl FileTimingSink {
    pub fn new(dir: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        FileTimingSink {
            dir: dir.into(),
            template: template.into(),
            streams: HashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.timing_dir, &config.timing_file_template)
    }

    pub fn path_for(&self, strategy: Strategy, backend_id: &str) -> Result<PathBuf, EngineError> {
        let name = expand_timing_template(&self.template, strategy.slug(), backend_id)?;
        Ok(self.dir.join(name))
    }

    fn open(&self, measurement: &Measurement) -> Result<LineWriter<File>, EngineError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(measurement.strategy, &measurement.backend_id)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut stream = LineWriter::new(file);
        writeln!(
            stream,
            "{} using {}",
            measurement.strategy, measurement.backend_description
        )?;
        writeln!(stream, "TILE_SIZE {}", measurement.tile_edge)?;
        info!(path = %path.display(), "opened timing log");
        Ok(stream)
    }
}

impl TimingSink for FileTimingSink {
    fn record(&mut self, measurement: &Measurement) -> Result<(), EngineError> {
        let key = (measurement.strategy, measurement.backend_id.clone());
        if !self.streams.contains_key(&key) {
            let stream = self.open(measurement)?;
            self.streams.insert(key.clone(), stream);
        }
        if let Some(stream) = self.streams.get_mut(&key) {
            writeln!(stream, "{}", measurement.elapsed_ms)?;
        }
        Ok(())
    }
}

/// Keeps measurements in memory; clones share the same list.
#[derive(Clone, Default)]
pub struct MemoryTimingSink {
    records: Arc<Mutex<Vec<Measurement>>>,
}

impl MemoryTimingSink {
    pub fn records(&self) -> Vec<Measurement> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TimingSink for MemoryTimingSink {
    fn record(&mut self, measurement: &Measurement) -> Result<(), EngineError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(measurement.clone());
        }
        Ok(())
    }
}

pub struct TimingHarness {
    sink: Box<dyn TimingSink>,
}

impl TimingHarness {
    pub fn new(sink: Box<dyn TimingSink>) -> Self {
        TimingHarness { sink }
    }

    /// Times `invoke`, which must return only once the output is host
    /// readable. A failed invocation still consumes its shot.
    pub fn measure<F>(
        &mut self,
        state: &mut TimingState,
        strategy: Strategy,
        backend: &BackendDescriptor,
        tile_edge: usize,
        invoke: F,
    ) -> Result<Duration, EngineError>
    where
        F: FnOnce() -> Result<(), EngineError>,
    {
        let measured = state.is_active();
        let start = Instant::now();
        let outcome = invoke();
        let elapsed = start.elapsed();
        state.consume();
        outcome?;

        if measured {
            let measurement = Measurement {
                strategy,
                backend_id: backend.id.clone(),
                backend_description: backend.description.clone(),
                tile_edge,
                elapsed_ms: elapsed.as_millis(),
            };
            if let Err(e) = self.sink.record(&measurement) {
                error!("failed to record timing: {e}");
            }
        } else {
            info!("{strategy} on {}: {} ms", backend.id, elapsed.as_millis());
        }
        Ok(elapsed)
    }
}
