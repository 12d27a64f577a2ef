//! In-memory [`PulseGenerator`] used by tests and the demo binary.
//!
//! The device state lives behind an `Arc<Mutex<_>>` so a test can keep a [`DummyPulserHandle`]
//! and inspect what was written after the pulser itself moved into a worker thread.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use maplit::btreeset;
use ndarray::{concatenate, Array1, Axis};
use parking_lot::Mutex;

use crate::error::{PulsedError, Result};
use crate::hardware::*;
use crate::pulse_objects::SequenceStep;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredWaveform {
    pub analog: IndexMap<String, Array1<f32>>,
    pub digital: IndexMap<String, Array1<bool>>,
    pub total_number_of_samples: u64,
    pub complete: bool,
}

impl StoredWaveform {
    pub fn len(&self) -> usize {
        WaveformChunk {
            analog: self.analog.clone(),
            digital: self.digital.clone(),
            ..Default::default()
        }
        .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct DummyPulserState {
    pub active_channels: BTreeSet<String>,
    pub sample_rate: f64,
    pub analog_amplitudes: IndexMap<String, f64>,
    pub waveforms: IndexMap<String, StoredWaveform>,
    pub sequences: IndexMap<String, Vec<(Vec<String>, SequenceStep)>>,
    pub uploaded: BTreeSet<String>,
    pub loaded: Option<String>,
    pub output_on: bool,
    /// One entry per hardware call, e.g. `write_waveform rabi 0..1000`.
    pub call_log: Vec<String>,
    /// Fail every call after this many successful write calls.
    pub fail_after_writes: Option<usize>,
    pub writes: usize,
}

pub type DummyPulserHandle = Arc<Mutex<DummyPulserState>>;

pub struct DummyPulser {
    constraints: Constraints,
    state: DummyPulserHandle,
}

/// Two analog and eight digital channels, 1 MSa/s to 1 GSa/s, 16 MSa memory.
pub fn dummy_constraints() -> Constraints {
    let analog = |n: usize| (1..=n).map(|i| format!("a_ch{}", i));
    let digital = |n: usize| (1..=n).map(|i| format!("d_ch{}", i));
    let mut activation_configs = IndexMap::new();
    activation_configs.insert(
        "all".to_string(),
        analog(2).chain(digital(8)).collect::<BTreeSet<_>>(),
    );
    activation_configs.insert(
        "analog1_digital4".to_string(),
        analog(1).chain(digital(4)).collect::<BTreeSet<_>>(),
    );
    activation_configs.insert("digital_only".to_string(), digital(8).collect());
    Constraints {
        sample_rate: (1e6, 1e9),
        a_ch_amplitude: (0.02, 2.0),
        waveform_length: (1, 16 * 1024 * 1024),
        sequence_steps_max: 8000,
        activation_configs,
        sequence_option: SequenceOption::Optional,
        sequence_step_options: btreeset! {
            "repetitions".to_string(),
            "go_to".to_string(),
            "event_jump_to".to_string(),
            "event_trigger".to_string(),
            "wait_for".to_string(),
            "flag_trigger".to_string(),
            "flag_high".to_string(),
        },
    }
}

impl DummyPulser {
    pub fn new(constraints: Constraints) -> Self {
        let active_channels = constraints
            .activation_configs
            .values()
            .next()
            .cloned()
            .unwrap_or_default();
        let analog_amplitudes = active_channels
            .iter()
            .filter(|ch| ch.starts_with("a_"))
            .map(|ch| (ch.clone(), 1.0))
            .collect();
        let state = DummyPulserState {
            active_channels,
            sample_rate: constraints.sample_rate.1,
            analog_amplitudes,
            ..Default::default()
        };
        DummyPulser {
            constraints,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn handle(&self) -> DummyPulserHandle {
        self.state.clone()
    }

    fn check_failure(state: &mut DummyPulserState, call: &str) -> Result<()> {
        if let Some(limit) = state.fail_after_writes {
            if state.writes >= limit {
                return Err(PulsedError::hardware(format!("dummy pulser refused {}", call)));
            }
        }
        Ok(())
    }
}

impl Default for DummyPulser {
    fn default() -> Self {
        DummyPulser::new(dummy_constraints())
    }
}

impl PulseGenerator for DummyPulser {
    fn get_constraints(&self) -> Constraints {
        self.constraints.clone()
    }

    fn active_channels(&self) -> BTreeSet<String> {
        self.state.lock().active_channels.clone()
    }

    fn set_active_channels(&mut self, channels: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let mut state = self.state.lock();
        state.call_log.push("set_active_channels".to_string());
        if self.constraints.activation_config_name(channels).is_none() {
            return Err(PulsedError::hardware(format!(
                "dummy pulser has no activation config {:?}",
                channels
            )));
        }
        state.active_channels = channels.clone();
        Ok(state.active_channels.clone())
    }

    fn sample_rate(&self) -> f64 {
        self.state.lock().sample_rate
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<f64> {
        let mut state = self.state.lock();
        state.call_log.push(format!("set_sample_rate {}", rate));
        let (min, max) = self.constraints.sample_rate;
        state.sample_rate = rate.clamp(min, max);
        Ok(state.sample_rate)
    }

    fn analog_amplitudes(&self) -> IndexMap<String, f64> {
        self.state.lock().analog_amplitudes.clone()
    }

    fn set_analog_amplitudes(
        &mut self,
        amplitudes: &IndexMap<String, f64>,
    ) -> Result<IndexMap<String, f64>> {
        let mut state = self.state.lock();
        state.call_log.push("set_analog_amplitudes".to_string());
        for (chan, amp) in amplitudes {
            state.analog_amplitudes.insert(chan.clone(), *amp);
        }
        Ok(state.analog_amplitudes.clone())
    }

    fn write_waveform(&mut self, name: &str, chunk: &WaveformChunk) -> Result<usize> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state, "write_waveform")?;
        let stored = if chunk.is_first_chunk {
            StoredWaveform {
                total_number_of_samples: chunk.total_number_of_samples,
                ..Default::default()
            }
        } else {
            state.waveforms.shift_remove(name).ok_or_else(|| {
                PulsedError::hardware(format!("continuation chunk for unknown waveform {}", name))
            })?
        };
        let start = stored.len();
        let mut stored = stored;
        for (chan, samples) in &chunk.analog {
            let joined = match stored.analog.get(chan) {
                Some(prev) => concatenate(Axis(0), &[prev.view(), samples.view()])
                    .map_err(|e| PulsedError::hardware(e.to_string()))?,
                None => samples.clone(),
            };
            stored.analog.insert(chan.clone(), joined);
        }
        for (chan, samples) in &chunk.digital {
            let joined = match stored.digital.get(chan) {
                Some(prev) => concatenate(Axis(0), &[prev.view(), samples.view()])
                    .map_err(|e| PulsedError::hardware(e.to_string()))?,
                None => samples.clone(),
            };
            stored.digital.insert(chan.clone(), joined);
        }
        stored.complete = chunk.is_last_chunk;
        let written = chunk.len();
        state
            .call_log
            .push(format!("write_waveform {} {}..{}", name, start, start + written));
        state.waveforms.insert(name.to_string(), stored);
        state.writes += 1;
        Ok(written)
    }

    fn write_sequence(&mut self, name: &str, steps: &[(Vec<String>, SequenceStep)]) -> Result<usize> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state, "write_sequence")?;
        for (waveforms, _) in steps {
            if let Some(missing) = waveforms.iter().find(|w| !state.waveforms.contains_key(*w)) {
                return Err(PulsedError::hardware(format!(
                    "sequence {} references missing waveform {}",
                    name, missing
                )));
            }
        }
        state.call_log.push(format!("write_sequence {} {}", name, steps.len()));
        state.sequences.insert(name.to_string(), steps.to_vec());
        state.writes += 1;
        Ok(steps.len())
    }

    fn upload_asset(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.waveforms.contains_key(name) && !state.sequences.contains_key(name) {
            return Err(PulsedError::hardware(format!("no asset {} to upload", name)));
        }
        state.call_log.push(format!("upload_asset {}", name));
        state.uploaded.insert(name.to_string());
        Ok(())
    }

    fn load_asset(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.uploaded.contains(name) {
            return Err(PulsedError::hardware(format!("asset {} not uploaded", name)));
        }
        state.call_log.push(format!("load_asset {}", name));
        state.loaded = Some(name.to_string());
        Ok(())
    }

    fn loaded_asset(&self) -> Option<String> {
        self.state.lock().loaded.clone()
    }

    fn waveform_names(&self) -> Vec<String> {
        self.state.lock().waveforms.keys().cloned().collect()
    }

    fn sequence_names(&self) -> Vec<String> {
        self.state.lock().sequences.keys().cloned().collect()
    }

    fn delete_waveform(&mut self, name: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.call_log.push(format!("delete_waveform {}", name));
        let deleted = match state.waveforms.shift_remove(name) {
            Some(_) => vec![name.to_string()],
            None => vec![],
        };
        state.uploaded.remove(name);
        if state.loaded.as_deref() == Some(name) {
            state.loaded = None;
        }
        Ok(deleted)
    }

    fn delete_sequence(&mut self, name: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.call_log.push(format!("delete_sequence {}", name));
        let deleted = match state.sequences.shift_remove(name) {
            Some(_) => vec![name.to_string()],
            None => vec![],
        };
        state.uploaded.remove(name);
        if state.loaded.as_deref() == Some(name) {
            state.loaded = None;
        }
        Ok(deleted)
    }

    fn clear_all(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.call_log.push("clear_all".to_string());
        state.waveforms.clear();
        state.sequences.clear();
        state.uploaded.clear();
        state.loaded = None;
        Ok(())
    }

    fn set_output(&mut self, on: bool) -> Result<bool> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state, "set_output")?;
        state.call_log.push(format!("set_output {}", on));
        state.output_on = on;
        Ok(on)
    }
}
