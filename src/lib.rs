pub mod cli;
pub mod compiler;
pub mod driver;
pub mod engine;
pub mod error;
pub mod graph;
pub mod handoff;
pub mod netlist;
pub mod waveform;

// Re-export commonly used types
pub use compiler::compile;
pub use driver::{SessionState, SimulationSession};
pub use graph::{CircuitDescription, ElementKind, ElementValue, TopologyGraph};
pub use netlist::{Analysis, Netlist};
pub use waveform::WaveformTable;

// Error types
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
