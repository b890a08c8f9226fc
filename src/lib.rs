pub mod clock;
pub mod config;
pub mod distance;
pub mod engine;
pub mod location;

pub use config::{ConfigError, EngineConfig, ProviderKind};
pub use engine::GeocodeEngine;
pub use location::{Address, Coordinate, GeocodeError, Precision, ResolutionEntry};
