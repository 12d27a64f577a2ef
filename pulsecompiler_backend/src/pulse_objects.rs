//! Hardware-independent description of pulse waveforms and sequencer programs.
//!
//! From leaf to root:
//!
//! 1. [`PulseBlockElement`]: one segment of fixed (or per-repetition incremented) duration with a
//!    shape on every analog channel and a level on every digital channel.
//! 2. [`PulseBlock`]: a named, ordered list of elements, stored on its own so several ensembles can
//!    reference it.
//! 3. [`PulseBlockEnsemble`]: a named list of `(block name, repetitions)` forming one waveform.
//! 4. [`PulseSequence`]: a named list of [`SequenceStep`]s, each playing an ensemble with
//!    sequencer flags.
//!
//! Nothing in this module knows about hardware. Channel names, sample rates and memory limits are
//! only checked when an object is compiled, so objects can be built and stored offline.
//!
//! Ensembles and sequences carry two optional records:
//!
//! - [`MeasurementInformation`], written by predefined generators. Tells the measurement side how
//!   to interpret the counter trace.
//! - [`SamplingInformation`], written only by the compiler. Present exactly while the hardware holds
//!   data sampled from the current version of the object. Editing an object through the
//!   mutating methods of this module drops it.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::shapes::ShapeDescriptor;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseBlockElement {
    /// Duration on the first repetition, seconds.
    pub init_length_s: f64,
    /// Added to the duration on every further repetition of the owning block, seconds.
    #[serde(default)]
    pub increment_s: f64,
    /// Analog channel name to shape.
    pub pulse_function: IndexMap<String, ShapeDescriptor>,
    /// Digital channel name to level.
    pub digital_high: IndexMap<String, bool>,
    /// Marks the element as a laser-on reference point.
    #[serde(default)]
    pub laser_on: bool,
}

impl PulseBlockElement {
    pub fn new(
        init_length_s: f64,
        increment_s: f64,
        pulse_function: IndexMap<String, ShapeDescriptor>,
        digital_high: IndexMap<String, bool>,
        laser_on: bool,
    ) -> Self {
        PulseBlockElement {
            init_length_s,
            increment_s,
            pulse_function,
            digital_high,
            laser_on,
        }
    }

    /// Ideal duration during repetition `rep_no` (0-based) of the owning block.
    pub fn length_s(&self, rep_no: usize) -> f64 {
        self.init_length_s + rep_no as f64 * self.increment_s
    }

    pub fn analog_channels(&self) -> BTreeSet<String> {
        self.pulse_function.keys().cloned().collect()
    }

    pub fn digital_channels(&self) -> BTreeSet<String> {
        self.digital_high.keys().cloned().collect()
    }

    pub fn channel_set(&self) -> BTreeSet<String> {
        let mut channels = self.analog_channels();
        channels.extend(self.digital_channels());
        channels
    }

    pub fn is_high(&self, channel: &str) -> bool {
        self.digital_high.get(channel).copied().unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseBlock {
    pub name: String,
    pub element_list: Vec<PulseBlockElement>,
}

impl PulseBlock {
    pub fn new(name: &str, element_list: Vec<PulseBlockElement>) -> Self {
        PulseBlock {
            name: name.to_string(),
            element_list,
        }
    }

    pub fn append(&mut self, element: PulseBlockElement) {
        self.element_list.push(element);
    }

    pub fn init_length_s(&self) -> f64 {
        self.element_list.iter().map(|e| e.init_length_s).sum()
    }

    pub fn increment_s(&self) -> f64 {
        self.element_list.iter().map(|e| e.increment_s).sum()
    }

    /// Ideal duration of `repetitions` consecutive plays of this block.
    pub fn total_length_s(&self, repetitions: usize) -> f64 {
        let reps = repetitions as f64;
        self.init_length_s() * reps + self.increment_s() * reps * (reps - 1.0) / 2.0
    }

    pub fn analog_channels(&self) -> BTreeSet<String> {
        self.element_list
            .first()
            .map(|e| e.analog_channels())
            .unwrap_or_default()
    }

    pub fn digital_channels(&self) -> BTreeSet<String> {
        self.element_list
            .first()
            .map(|e| e.digital_channels())
            .unwrap_or_default()
    }

    pub fn channel_set(&self) -> BTreeSet<String> {
        self.element_list
            .first()
            .map(|e| e.channel_set())
            .unwrap_or_default()
    }

    /// Index of the first element whose channel set differs from the first element's.
    pub fn inconsistent_element(&self) -> Option<usize> {
        let reference = self.channel_set();
        self.element_list
            .iter()
            .position(|e| e.channel_set() != reference)
    }
}

/// Metadata describing how to interpret the counter data of a generated measurement.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementInformation {
    pub alternating: bool,
    /// Laser indices to drop before analysis. Negative indices count from the end.
    pub laser_ignore_list: Vec<i64>,
    pub controlled_variable: Vec<f64>,
    /// `(x unit, y unit)`
    pub units: (String, String),
    /// `(x label, y label)`
    pub labels: (String, String),
    pub number_of_lasers: usize,
    /// Counter record length needed to capture one full playback, seconds.
    pub counting_length: f64,
}

/// Pulse generator state a waveform was sampled with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PulseGeneratorSettings {
    pub sample_rate: f64,
    pub activation_config: (String, BTreeSet<String>),
    /// Peak-to-peak amplitude per analog channel, volts.
    pub analog_amplitudes: IndexMap<String, f64>,
}

/// Read-only record produced by compilation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingInformation {
    pub number_of_samples: u64,
    pub number_of_elements: usize,
    /// Realized length of every element in playback order.
    pub elements_length_bins: Vec<u64>,
    pub digital_rising_bins: IndexMap<String, Vec<u64>>,
    pub digital_falling_bins: IndexMap<String, Vec<u64>>,
    pub analog_channels: BTreeSet<String>,
    pub digital_channels: BTreeSet<String>,
    pub pulse_generator_settings: PulseGeneratorSettings,
    /// Names of the waveforms written to hardware.
    pub waveforms: Vec<String>,
}

impl SamplingInformation {
    pub fn sample_rate(&self) -> f64 {
        self.pulse_generator_settings.sample_rate
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseBlockEnsemble {
    pub name: String,
    /// `(block name, repetitions)`; repetitions count total plays and must be at least 1.
    pub block_list: Vec<(String, usize)>,
    #[serde(default)]
    pub rotating_frame: bool,
    #[serde(default)]
    pub measurement_information: Option<MeasurementInformation>,
    #[serde(default)]
    pub sampling_information: Option<SamplingInformation>,
}

impl PulseBlockEnsemble {
    pub fn new(name: &str, block_list: Vec<(String, usize)>, rotating_frame: bool) -> Self {
        PulseBlockEnsemble {
            name: name.to_string(),
            block_list,
            rotating_frame,
            measurement_information: None,
            sampling_information: None,
        }
    }

    pub fn append(&mut self, block_name: &str, repetitions: usize) {
        self.block_list.push((block_name.to_string(), repetitions));
        self.sampling_information = None;
    }

    pub fn is_sampled(&self) -> bool {
        self.sampling_information.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepRepetitions {
    Finite(u32),
    Infinite,
}

impl Default for StepRepetitions {
    fn default() -> Self {
        StepRepetitions::Finite(1)
    }
}

/// One sequencer step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub ensemble: String,
    #[serde(default)]
    pub repetitions: StepRepetitions,
    /// Step index (0-based) to continue with; `None` continues with the next step, or terminates
    /// after the last one.
    #[serde(default)]
    pub go_to: Option<usize>,
    #[serde(default)]
    pub event_jump_to: Option<usize>,
    #[serde(default)]
    pub event_trigger: Option<String>,
    #[serde(default)]
    pub wait_for: Option<String>,
    #[serde(default)]
    pub flag_trigger: Vec<String>,
    #[serde(default)]
    pub flag_high: Vec<String>,
}

impl SequenceStep {
    pub fn new(ensemble: &str, repetitions: StepRepetitions) -> Self {
        SequenceStep {
            ensemble: ensemble.to_string(),
            repetitions,
            go_to: None,
            event_jump_to: None,
            event_trigger: None,
            wait_for: None,
            flag_trigger: Vec::new(),
            flag_high: Vec::new(),
        }
    }

    /// Sequencer options this step relies on besides plain playback.
    pub fn used_options(&self) -> Vec<&'static str> {
        let mut used = Vec::new();
        if self.go_to.is_some() {
            used.push("go_to");
        }
        if self.event_jump_to.is_some() {
            used.push("event_jump_to");
        }
        if self.event_trigger.is_some() {
            used.push("event_trigger");
        }
        if self.wait_for.is_some() {
            used.push("wait_for");
        }
        if !self.flag_trigger.is_empty() {
            used.push("flag_trigger");
        }
        if !self.flag_high.is_empty() {
            used.push("flag_high");
        }
        if self.repetitions == StepRepetitions::Infinite {
            used.push("repetitions");
        }
        used
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseSequence {
    pub name: String,
    pub steps: Vec<SequenceStep>,
    #[serde(default)]
    pub rotating_frame: bool,
    #[serde(default)]
    pub measurement_information: Option<MeasurementInformation>,
    #[serde(default)]
    pub sampling_information: Option<SamplingInformation>,
}

impl PulseSequence {
    pub fn new(name: &str, steps: Vec<SequenceStep>, rotating_frame: bool) -> Self {
        PulseSequence {
            name: name.to_string(),
            steps,
            rotating_frame,
            measurement_information: None,
            sampling_information: None,
        }
    }

    pub fn append(&mut self, step: SequenceStep) {
        self.steps.push(step);
        self.sampling_information = None;
    }

    pub fn is_finite(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.repetitions != StepRepetitions::Infinite)
    }

    /// Distinct ensemble names in order of first use.
    pub fn ensemble_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for step in &self.steps {
            if !names.contains(&step.ensemble) {
                names.push(step.ensemble.clone());
            }
        }
        names
    }

    pub fn is_sampled(&self) -> bool {
        self.sampling_information.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indexmap::indexmap;

    fn element(length: f64, increment: f64, laser: bool) -> PulseBlockElement {
        PulseBlockElement::new(
            length,
            increment,
            indexmap! {"a_ch1".to_string() => ShapeDescriptor::idle()},
            indexmap! {"d_ch1".to_string() => laser},
            laser,
        )
    }

    #[test]
    fn block_lengths() {
        let block = PulseBlock::new(
            "rabi",
            vec![element(10e-9, 10e-9, false), element(3e-6, 0.0, true)],
        );
        assert!((block.init_length_s() - 3.01e-6).abs() < 1e-15);
        assert!((block.increment_s() - 10e-9).abs() < 1e-18);
        // 3 plays: 3 * 3.01us + 10ns * (0 + 1 + 2)
        assert!((block.total_length_s(3) - (3.0 * 3.01e-6 + 30e-9)).abs() < 1e-15);
        assert!((block.element_list[0].length_s(2) - 30e-9).abs() < 1e-18);
    }

    #[test]
    fn channel_consistency() {
        let mut block = PulseBlock::new("b", vec![element(1e-6, 0.0, false)]);
        assert_eq!(block.inconsistent_element(), None);
        let odd = PulseBlockElement::new(
            1e-6,
            0.0,
            IndexMap::new(),
            indexmap! {"d_ch1".to_string() => true},
            false,
        );
        block.append(odd);
        assert_eq!(block.inconsistent_element(), Some(1));
        assert_eq!(
            block.channel_set().into_iter().collect::<Vec<_>>(),
            vec!["a_ch1", "d_ch1"]
        );
    }

    #[test]
    fn editing_drops_sampling_information() {
        let mut ensemble = PulseBlockEnsemble::new("e", vec![("b".to_string(), 1)], false);
        ensemble.sampling_information = Some(SamplingInformation::default());
        assert!(ensemble.is_sampled());
        ensemble.append("b", 2);
        assert!(!ensemble.is_sampled());
    }

    #[test]
    fn sequence_properties() {
        let mut seq = PulseSequence::new("s", vec![], false);
        seq.append(SequenceStep::new("a", StepRepetitions::Finite(3)));
        seq.append(SequenceStep::new("b", StepRepetitions::Finite(1)));
        seq.append(SequenceStep::new("a", StepRepetitions::Finite(1)));
        assert!(seq.is_finite());
        assert_eq!(seq.ensemble_names(), vec!["a", "b"]);

        let mut step = SequenceStep::new("b", StepRepetitions::Infinite);
        step.go_to = Some(0);
        assert_eq!(step.used_options(), vec!["go_to", "repetitions"]);
        seq.append(step);
        assert!(!seq.is_finite());
    }

    #[test]
    fn structural_equality() {
        let a = PulseBlock::new("b", vec![element(1e-6, 0.0, true)]);
        let b = PulseBlock::new("b", vec![element(1e-6, 0.0, true)]);
        let c = PulseBlock::new("b", vec![element(2e-6, 0.0, true)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
