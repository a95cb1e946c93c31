pub mod backend;
pub mod colors;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod fractals;
#[cfg(feature = "gpu")]
pub mod gpu_engine;
pub mod state;
pub mod strategies;
pub mod timing;
pub mod workgroup;

pub use backend::{BackendDescriptor, BackendRegistry, ComputeBackend, CpuBackend};
pub use config::EngineConfig;
pub use engine::{Engine, Output};
pub use error::EngineError;
pub use state::ConfigEvent;
pub use strategies::{Strategy, TileScatter};
