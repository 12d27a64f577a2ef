//! Contract of the pulse generator hardware consumed by the compiler.
//!
//! The compiler never talks to a device directly. It drives anything implementing
//! [`PulseGenerator`], which exposes the narrow surface needed to configure the output, write
//! sampled data and manage named assets on the device. Hardware limits are reported once through
//! [`Constraints`] and checked by the compiler before anything is written.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use ndarray::Array1;

use crate::error::Result;
use crate::pulse_objects::SequenceStep;

/// Availability of the hardware sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceOption {
    /// No sequencer, only plain waveforms.
    NonExistent,
    /// Sequences and plain waveforms are both supported.
    Optional,
    /// Every waveform must be played through a sequence.
    Forced,
}

/// Hardware-reported limits.
#[derive(Clone, Debug, PartialEq)]
pub struct Constraints {
    /// `(min, max)` sample rate, samples per second.
    pub sample_rate: (f64, f64),
    /// `(min, max)` peak-to-peak amplitude of analog channels, volts.
    pub a_ch_amplitude: (f64, f64),
    /// `(min, max)` number of samples in one waveform.
    pub waveform_length: (u64, u64),
    pub sequence_steps_max: usize,
    /// Named sets of channels the device can activate together.
    pub activation_configs: IndexMap<String, BTreeSet<String>>,
    pub sequence_option: SequenceOption,
    /// Step flags the sequencer understands, see [`SequenceStep::used_options`].
    pub sequence_step_options: BTreeSet<String>,
}

impl Constraints {
    /// Union of all channels of all activation configs.
    pub fn all_channels(&self) -> BTreeSet<String> {
        self.activation_configs
            .values()
            .flat_map(|chans| chans.iter().cloned())
            .collect()
    }

    pub fn sample_rate_in_range(&self, rate: f64) -> bool {
        rate >= self.sample_rate.0 && rate <= self.sample_rate.1
    }

    /// Name of the activation config matching `channels` exactly.
    pub fn activation_config_name(&self, channels: &BTreeSet<String>) -> Option<&str> {
        self.activation_configs
            .iter()
            .find(|(_, chans)| *chans == channels)
            .map(|(name, _)| name.as_str())
    }
}

/// Slice of a waveform handed to the hardware in one write call.
///
/// Analog values are normalized to the channel's peak-to-peak amplitude, so `1.0` means the
/// positive full-scale voltage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WaveformChunk {
    pub analog: IndexMap<String, Array1<f32>>,
    pub digital: IndexMap<String, Array1<bool>>,
    pub is_first_chunk: bool,
    pub is_last_chunk: bool,
    pub total_number_of_samples: u64,
}

impl WaveformChunk {
    pub fn len(&self) -> usize {
        self.analog
            .values()
            .map(|a| a.len())
            .chain(self.digital.values().map(|d| d.len()))
            .next()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pulse generator (AWG / pulse streamer) as seen by the compiler.
///
/// All methods return [`crate::PulsedError::HardwareCommunication`] when the device fails or
/// does not answer.
pub trait PulseGenerator: Send {
    fn get_constraints(&self) -> Constraints;

    fn active_channels(&self) -> BTreeSet<String>;
    /// Returns the channels actually active afterwards.
    fn set_active_channels(&mut self, channels: &BTreeSet<String>) -> Result<BTreeSet<String>>;

    fn sample_rate(&self) -> f64;
    /// Returns the sample rate actually set.
    fn set_sample_rate(&mut self, rate: f64) -> Result<f64>;

    fn analog_amplitudes(&self) -> IndexMap<String, f64>;
    fn set_analog_amplitudes(
        &mut self,
        amplitudes: &IndexMap<String, f64>,
    ) -> Result<IndexMap<String, f64>>;

    /// Writes one chunk of waveform `name`, returning the number of samples written.
    fn write_waveform(&mut self, name: &str, chunk: &WaveformChunk) -> Result<usize>;
    /// Writes a sequence whose steps play the listed waveforms. Returns the number of steps written.
    fn write_sequence(&mut self, name: &str, steps: &[(Vec<String>, SequenceStep)]) -> Result<usize>;

    /// Transfers an asset to device memory where this is a separate step.
    fn upload_asset(&mut self, name: &str) -> Result<()>;
    /// Loads an asset for playback.
    fn load_asset(&mut self, name: &str) -> Result<()>;
    fn loaded_asset(&self) -> Option<String>;

    fn waveform_names(&self) -> Vec<String>;
    fn sequence_names(&self) -> Vec<String>;
    /// Returns the deleted waveform names.
    fn delete_waveform(&mut self, name: &str) -> Result<Vec<String>>;
    fn delete_sequence(&mut self, name: &str) -> Result<Vec<String>>;
    /// Deletes every waveform and sequence.
    fn clear_all(&mut self) -> Result<()>;

    /// Switches the output on or off, returning the new state.
    fn set_output(&mut self, on: bool) -> Result<bool>;
}
