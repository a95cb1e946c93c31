use std::{collections::HashMap, fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use strfmt::Format;

use crate::{
    colors::ColorBias,
    error::EngineError,
    fractals::{ComputeDomain, Grid},
    strategies::{Strategy, TileScatter},
};

pub const WIDTH: usize = 2048;
pub const HEIGHT: usize = 2048;
pub const TILE_SIZE: usize = 8;
pub const DEFAULT_DOMAIN: ComputeDomain = ComputeDomain::new(-2.0, 1.0, 1.125, -1.125);
pub const DEFAULT_BIAS: ColorBias = ColorBias::new(250, 68, 32);
pub const MAX_TIMINGS: u32 = 100;
pub const DEFAULT_LANES: usize = 4;
pub const TIMING_FILE_TEMPLATE: &str = "{strategy}_{backend}.csv";

/// Fills `{strategy}` and `{backend}` in a timing file template.
pub fn expand_timing_template(
    template: &str,
    strategy: &str,
    backend: &str,
) -> Result<String, EngineError> {
    let vars = HashMap::from([
        ("strategy".to_string(), strategy.to_string()),
        ("backend".to_string(), backend.to_string()),
    ]);
    template.format(&vars).map_err(|e| {
        EngineError::Config(format!("bad timing file template '{template}': {e}"))
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub width: usize,
    pub height: usize,
    pub tile_edge: usize,
    pub domain: ComputeDomain,
    pub max_iterations: u32,
    pub bias: ColorBias,
    pub strategy: Strategy,
    pub backend: usize,
    pub timing_shots: u32,
    pub timing_dir: PathBuf,
    pub timing_file_template: String,
    pub tile_scatter: TileScatter,
    /// `None` uses every core.
    pub cpu_threads: Option<usize>,
    pub cpu_lanes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            width: WIDTH,
            height: HEIGHT,
            tile_edge: TILE_SIZE,
            domain: DEFAULT_DOMAIN,
            max_iterations: 0,
            bias: DEFAULT_BIAS,
            strategy: Strategy::Packed,
            backend: 0,
            timing_shots: MAX_TIMINGS,
            timing_dir: PathBuf::from("."),
            timing_file_template: TIMING_FILE_TEMPLATE.to_string(),
            tile_scatter: TileScatter::Leader,
            cpu_threads: None,
            cpu_lanes: DEFAULT_LANES,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.width, self.height)
    }

    /// Expands the timing file template for one (strategy, backend) pair.
    pub fn timing_file_name(&self, strategy: &str, backend: &str) -> Result<String, EngineError> {
        expand_timing_template(&self.timing_file_template, strategy, backend)
    }

    /// Checks every precondition that must hold before the first dispatch.
    pub fn validate(&self) -> Result<(), EngineError> {
        let grid = self.grid();
        grid.check_tile_edge(self.tile_edge)?;
        if self.strategy == Strategy::Channel {
            grid.check_square()?;
        }
        if self.cpu_lanes == 0 {
            return Err(EngineError::Config("cpu_lanes must be positive".into()));
        }
        if self.cpu_threads == Some(0) {
            return Err(EngineError::Config("cpu_threads must be positive".into()));
        }
        if self.timing_shots == 0 {
            return Err(EngineError::Config("timing_shots must be positive".into()));
        }
        self.timing_file_name("packed", "cpu")?;
        Ok(())
    }
}
