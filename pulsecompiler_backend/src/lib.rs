//! Compiler side of a pulsed-measurement control system.
//!
//! Pulse waveforms are described declaratively ([`pulse_objects`]), compiled onto the integer sample
//! grid of a pulse generator without accumulated timing drift ([`sampler`]) and streamed to the
//! hardware in bounded chunks. [`generator::SequenceGenerator`] ties this together with object
//! storage, device settings and the predefined measurement recipes.
//!
//! Strategies (sampling functions, predefined generators, and on the measurement side extraction and
//! analysis methods) are collected in immutable [`registry::Registry`] snapshots.

pub mod dummy_pulser;
pub mod error;
pub mod generator;
pub mod hardware;
pub mod params;
pub mod predefined;
pub mod pulse_objects;
pub mod registry;
pub mod sampler;
pub mod shapes;
pub mod storage;
pub mod utils;

pub use error::*;
pub use generator::*;
pub use hardware::*;
pub use params::*;
pub use pulse_objects::*;
pub use registry::*;
pub use shapes::*;
