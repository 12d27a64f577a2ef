//! Error taxonomy shared by the compiler and the measurement side.
//!
//! Every fallible operation in this workspace returns [`Result`]. The variants map one-to-one to
//! the failure classes callers have to tell apart:
//!
//! - [`PulsedError::Configuration`]: an invalid or out-of-range request (unsupported sample rate,
//!   unknown channel, bad parameter value). Surfaced synchronously, never retried.
//! - [`PulsedError::ResourceExceeded`]: a request that is valid but does not fit the device
//!   (waveform longer than the sample memory, too many sequence steps).
//! - [`PulsedError::HardwareCommunication`]: a hardware collaborator failed, returned an error
//!   status or did not answer.
//! - [`PulsedError::PluginLoad`]: a plugin module could not be loaded. Registries log and skip it.
//! - [`PulsedError::Lookup`]: an unregistered strategy or unknown stored object was requested.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PulsedError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource exceeded: {what} requires {requested} but the limit is {limit}")]
    ResourceExceeded {
        what: String,
        requested: u64,
        limit: u64,
    },

    #[error("Hardware communication error: {0}")]
    HardwareCommunication(String),

    #[error("Failed to load plugin module '{module}': {reason}")]
    PluginLoad { module: String, reason: String },

    #[error("No entry named '{name}' in {registry}")]
    Lookup { registry: String, name: String },

    /// Extraction or analysis could not produce a result from the supplied data.
    #[error("Processing error: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PulsedError>;

impl PulsedError {
    pub fn config(msg: impl Into<String>) -> Self {
        PulsedError::Configuration(msg.into())
    }

    pub fn hardware(msg: impl Into<String>) -> Self {
        PulsedError::HardwareCommunication(msg.into())
    }

    pub fn lookup(registry: impl Into<String>, name: impl Into<String>) -> Self {
        PulsedError::Lookup {
            registry: registry.into(),
            name: name.into(),
        }
    }

    /// True for errors that must stop a running measurement.
    pub fn is_hardware(&self) -> bool {
        matches!(self, PulsedError::HardwareCommunication(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_messages() {
        let err = PulsedError::config("sample rate 2e9 out of range");
        assert_eq!(
            err.to_string(),
            "Configuration error: sample rate 2e9 out of range"
        );

        let err = PulsedError::ResourceExceeded {
            what: "waveform samples".to_string(),
            requested: 10,
            limit: 5,
        };
        assert!(err.to_string().contains("requires 10"));

        let err = PulsedError::lookup("extraction methods", "foo");
        assert_eq!(err.to_string(), "No entry named 'foo' in extraction methods");
    }

    #[test]
    fn io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PulsedError = io.into();
        assert!(matches!(err, PulsedError::Io(_)));
        assert!(!err.is_hardware());
        assert!(PulsedError::hardware("timeout").is_hardware());
    }
}
