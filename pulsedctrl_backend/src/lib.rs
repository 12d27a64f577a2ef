//! Measurement side of a pulsed-measurement control system.
//!
//! Runs pulsed measurements against pulse programs compiled by `pulsecompiler_backend`:
//! laser pulse [`extraction`], per-pulse [`analysis`], the acquisition loop in [`measurement`] with
//! its [`alternative`] data views and JSON [`export`],
//! and two worker threads ([`worker`]) that each own their hardware behind a [`Coordinator`].

pub mod alternative;
pub mod analysis;
pub mod asset_guard;
pub mod config;
pub mod coordinator;
pub mod dummy_hardware;
pub mod export;
pub mod extraction;
pub mod hardware;
pub mod measurement;
pub mod worker;

pub use alternative::*;
pub use analysis::*;
pub use asset_guard::*;
pub use config::*;
pub use coordinator::*;
pub use export::*;
pub use extraction::*;
pub use hardware::*;
pub use measurement::*;
pub use worker::*;

pub use pulsecompiler_backend::error::{PulsedError, Result};
