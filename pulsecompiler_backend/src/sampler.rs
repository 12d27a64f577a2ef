//! The sampling engine: turns ensembles and sequences into hardware-exact sample data.
//!
//! ## Quantized timeline
//!
//! Element durations are real numbers, the hardware plays integer sample bins. [`QuantizedTimeline`]
//! keeps one running ideal time and one running emitted bin count for the *whole* ensemble (across
//! blocks and repetitions):
//!
//! ```text
//! t_ideal += duration
//! target  = round(t_ideal * sample_rate)
//! n       = target - n_emitted
//! n_emitted = target
//! ```
//!
//! Every element is therefore at most one bin off its ideal length while the total length is always
//! `round(T * sample_rate)`, no matter how many elements there are.
//!
//! ```
//! use pulsecompiler_backend::sampler::QuantizedTimeline;
//!
//! // 1.00004 bins per element, 10000.4 in total
//! let mut timeline = QuantizedTimeline::new(1e6);
//! let total: u64 = (0..10_000).map(|_| timeline.advance(1.00004e-6)).sum();
//! assert_eq!(total, 10_000);
//!
//! let mut timeline = QuantizedTimeline::new(1e9);
//! let total: u64 = (0..10_000).map(|_| timeline.advance(1.00004e-6)).sum();
//! assert_eq!(total, 10_000_400);
//! ```
//!
//! ## Sampling
//!
//! [`analyze_ensemble`] runs the timeline only, producing bin counts and digital edges.
//! [`EnsembleSampler`] validates the result against the hardware [`Constraints`] and then evaluates
//! every element over its bins and streams the samples to a [`PulseGenerator`] in chunks of bounded
//! size. Chunk boundaries do not influence any sample value. Nothing is written before all
//! validation passed, and a write that fails halfway removes the partial waveform again.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use ndarray::Array1;

use crate::error::{PulsedError, Result};
use crate::hardware::{Constraints, PulseGenerator, SequenceOption, WaveformChunk};
use crate::pulse_objects::*;
use crate::shapes::{ElementSpan, SamplingFunction};
use crate::registry::Registry;
use crate::utils::{ChunkCounter, TickTimer};

/// Zero-drift mapping from ideal durations to sample counts.
#[derive(Clone, Debug)]
pub struct QuantizedTimeline {
    sample_rate: f64,
    t_ideal: f64,
    n_emitted: u64,
}

impl QuantizedTimeline {
    pub fn new(sample_rate: f64) -> Self {
        QuantizedTimeline {
            sample_rate,
            t_ideal: 0.0,
            n_emitted: 0,
        }
    }

    /// Advances by `duration` seconds and returns the number of bins for that element.
    pub fn advance(&mut self, duration: f64) -> u64 {
        self.t_ideal += duration;
        let target = (self.t_ideal * self.sample_rate).round().max(0.0) as u64;
        let n = target.saturating_sub(self.n_emitted);
        self.n_emitted = self.n_emitted.max(target);
        n
    }

    pub fn emitted(&self) -> u64 {
        self.n_emitted
    }

    pub fn ideal_time(&self) -> f64 {
        self.t_ideal
    }
}

/// One element in playback order.
struct PlayedElement<'a> {
    element: &'a PulseBlockElement,
    rep_no: usize,
}

/// Flattens an ensemble into playback order, checking block references and repetition counts.
fn playback_order<'a>(
    ensemble: &PulseBlockEnsemble,
    blocks: &'a IndexMap<String, PulseBlock>,
) -> Result<Vec<PlayedElement<'a>>> {
    let mut played = Vec::new();
    for (block_name, reps) in &ensemble.block_list {
        let block = blocks
            .get(block_name)
            .ok_or_else(|| PulsedError::lookup("pulse blocks", block_name))?;
        if *reps < 1 {
            return Err(PulsedError::config(format!(
                "Block {} in ensemble {} has repetition count 0",
                block_name, ensemble.name
            )));
        }
        if let Some(index) = block.inconsistent_element() {
            return Err(PulsedError::config(format!(
                "Element {} of block {} uses a different channel set than the first element",
                index, block_name
            )));
        }
        for rep_no in 0..*reps {
            for element in &block.element_list {
                played.push(PlayedElement { element, rep_no });
            }
        }
    }
    Ok(played)
}

/// Timeline-only view of an ensemble.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnsembleAnalysis {
    pub number_of_samples: u64,
    pub ideal_length_s: f64,
    pub elements_length_bins: Vec<u64>,
    pub digital_rising_bins: IndexMap<String, Vec<u64>>,
    pub digital_falling_bins: IndexMap<String, Vec<u64>>,
    pub analog_channels: BTreeSet<String>,
    pub digital_channels: BTreeSet<String>,
}

impl EnsembleAnalysis {
    pub fn channel_set(&self) -> BTreeSet<String> {
        self.analog_channels
            .union(&self.digital_channels)
            .cloned()
            .collect()
    }

    /// Number of rising edges on `channel`.
    pub fn count_rising(&self, channel: &str) -> usize {
        self.digital_rising_bins
            .get(channel)
            .map_or(0, |bins| bins.len())
    }
}

/// Runs the quantized timeline over `ensemble`.
///
/// Digital edge detection starts from the levels of the ensemble's last element, so an edge at
/// bin 0 is only reported if playback in a loop actually produces one there.
pub fn analyze_ensemble(
    ensemble: &PulseBlockEnsemble,
    blocks: &IndexMap<String, PulseBlock>,
    sample_rate: f64,
) -> Result<EnsembleAnalysis> {
    if !(sample_rate > 0.0 && sample_rate.is_finite()) {
        return Err(PulsedError::config(format!(
            "Sample rate {} must be positive",
            sample_rate
        )));
    }
    let played = playback_order(ensemble, blocks)?;
    let first = played.first().ok_or_else(|| {
        PulsedError::config(format!("Ensemble {} contains no elements", ensemble.name))
    })?;
    let analog_channels = first.element.analog_channels();
    let digital_channels = first.element.digital_channels();
    let channel_set = first.element.channel_set();
    if let Some(other) = played.iter().find(|p| p.element.channel_set() != channel_set) {
        return Err(PulsedError::config(format!(
            "Blocks of ensemble {} use different channel sets: {:?} vs {:?}",
            ensemble.name,
            channel_set,
            other.element.channel_set()
        )));
    }

    let mut timeline = QuantizedTimeline::new(sample_rate);
    let mut analysis = EnsembleAnalysis {
        analog_channels,
        digital_channels: digital_channels.clone(),
        ..Default::default()
    };
    for chan in &digital_channels {
        analysis.digital_rising_bins.insert(chan.clone(), Vec::new());
        analysis.digital_falling_bins.insert(chan.clone(), Vec::new());
    }
    let mut levels: IndexMap<String, bool> = match played.last() {
        Some(last) => digital_channels
            .iter()
            .map(|chan| (chan.clone(), last.element.is_high(chan)))
            .collect(),
        None => IndexMap::new(),
    };

    for p in &played {
        let duration = p.element.length_s(p.rep_no);
        if !(duration >= 0.0 && duration.is_finite()) {
            return Err(PulsedError::config(format!(
                "Element of ensemble {} has invalid duration {}",
                ensemble.name, duration
            )));
        }
        let start_bin = timeline.emitted();
        let n = timeline.advance(duration);
        analysis.elements_length_bins.push(n);
        if n == 0 {
            continue;
        }
        for (chan, prev) in levels.iter_mut() {
            let high = p.element.is_high(chan);
            if high && !*prev {
                analysis.digital_rising_bins[chan.as_str()].push(start_bin);
            } else if !high && *prev {
                analysis.digital_falling_bins[chan.as_str()].push(start_bin);
            }
            *prev = high;
        }
    }
    analysis.number_of_samples = timeline.emitted();
    analysis.ideal_length_s = timeline.ideal_time();
    Ok(analysis)
}

/// `(length_s, length_bins, number_of_lasers)` summary of an ensemble.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EnsembleInfo {
    pub length_s: f64,
    pub length_bins: u64,
    pub number_of_lasers: usize,
}

/// Lasers are counted as rising edges on the gate channel if given, else on the laser channel.
pub fn ensemble_info(
    ensemble: &PulseBlockEnsemble,
    blocks: &IndexMap<String, PulseBlock>,
    sample_rate: f64,
    laser_channel: &str,
    gate_channel: Option<&str>,
) -> Result<EnsembleInfo> {
    let analysis = analyze_ensemble(ensemble, blocks, sample_rate)?;
    let count_channel = gate_channel.unwrap_or(laser_channel);
    let number_of_lasers = if analysis.digital_channels.contains(count_channel) {
        analysis.count_rising(count_channel)
    } else {
        // Analog laser channel: count laser_on elements with a transition
        let played = playback_order(ensemble, blocks)?;
        let mut prev = played.last().map_or(false, |p| p.element.laser_on);
        let mut count = 0;
        for (p, n) in played.iter().zip(&analysis.elements_length_bins) {
            if *n == 0 {
                continue;
            }
            if p.element.laser_on && !prev {
                count += 1;
            }
            prev = p.element.laser_on;
        }
        count
    };
    Ok(EnsembleInfo {
        length_s: analysis.number_of_samples as f64 / sample_rate,
        length_bins: analysis.number_of_samples,
        number_of_lasers,
    })
}

/// Aggregates [`ensemble_info`] over the steps of a sequence. Infinitely repeated steps count once.
pub fn sequence_info(
    sequence: &PulseSequence,
    ensembles: &IndexMap<String, PulseBlockEnsemble>,
    blocks: &IndexMap<String, PulseBlock>,
    sample_rate: f64,
    laser_channel: &str,
    gate_channel: Option<&str>,
) -> Result<EnsembleInfo> {
    let mut total = EnsembleInfo::default();
    for step in &sequence.steps {
        let ensemble = ensembles
            .get(&step.ensemble)
            .ok_or_else(|| PulsedError::lookup("pulse block ensembles", &step.ensemble))?;
        let info = ensemble_info(ensemble, blocks, sample_rate, laser_channel, gate_channel)?;
        let reps = match step.repetitions {
            StepRepetitions::Finite(n) => n as u64,
            StepRepetitions::Infinite => 1,
        };
        total.length_bins += info.length_bins * reps;
        total.number_of_lasers += info.number_of_lasers * reps as usize;
    }
    total.length_s = total.length_bins as f64 / sample_rate;
    Ok(total)
}

/// Accumulates samples and hands them to the generator in bounded chunks.
struct ChunkWriter<'g> {
    generator: &'g mut dyn PulseGenerator,
    name: String,
    chunk_samples: usize,
    total: u64,
    written: u64,
    buffered: usize,
    analog: IndexMap<String, Vec<f32>>,
    digital: IndexMap<String, Vec<bool>>,
}

impl<'g> ChunkWriter<'g> {
    fn flush(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }
        let is_first_chunk = self.written == 0;
        let is_last_chunk = self.written + self.buffered as u64 == self.total;
        let chunk = WaveformChunk {
            analog: self
                .analog
                .iter_mut()
                .map(|(chan, buf)| (chan.clone(), Array1::from(std::mem::take(buf))))
                .collect(),
            digital: self
                .digital
                .iter_mut()
                .map(|(chan, buf)| (chan.clone(), Array1::from(std::mem::take(buf))))
                .collect(),
            is_first_chunk,
            is_last_chunk,
            total_number_of_samples: self.total,
        };
        let written = self.generator.write_waveform(&self.name, &chunk)?;
        if written != self.buffered {
            return Err(PulsedError::hardware(format!(
                "Waveform {}: generator wrote {} of {} samples",
                self.name, written, self.buffered
            )));
        }
        tracing::debug!(
            "Waveform {}: wrote samples {}..{}",
            self.name,
            self.written,
            self.written + written as u64
        );
        self.written += written as u64;
        self.buffered = 0;
        Ok(())
    }

    fn room(&self) -> usize {
        self.chunk_samples - self.buffered
    }
}

/// Compiles ensembles and sequences against the current pulse generator settings.
pub struct EnsembleSampler<'a> {
    pub functions: &'a Registry<SamplingFunction>,
    pub settings: &'a PulseGeneratorSettings,
    pub constraints: &'a Constraints,
    /// Maximum number of samples buffered per write call.
    pub chunk_samples: usize,
}

impl<'a> EnsembleSampler<'a> {
    /// Checks an analysis against settings and hardware limits without touching the hardware.
    pub fn validate(&self, name: &str, analysis: &EnsembleAnalysis) -> Result<()> {
        let rate = self.settings.sample_rate;
        if !self.constraints.sample_rate_in_range(rate) {
            return Err(PulsedError::config(format!(
                "Sample rate {:e} outside of hardware range {:e}..{:e}",
                rate, self.constraints.sample_rate.0, self.constraints.sample_rate.1
            )));
        }
        let known = self.constraints.all_channels();
        let used = analysis.channel_set();
        if let Some(unknown) = used.difference(&known).next() {
            return Err(PulsedError::config(format!(
                "{} references unknown channel {}",
                name, unknown
            )));
        }
        let active = &self.settings.activation_config.1;
        if &used != active {
            return Err(PulsedError::config(format!(
                "{} uses channels {:?} but the active channels are {:?}",
                name, used, active
            )));
        }
        if let Some(chan) = analysis
            .analog_channels
            .iter()
            .find(|chan| self.settings.analog_amplitudes.get(*chan).map_or(true, |a| *a <= 0.0))
        {
            return Err(PulsedError::config(format!(
                "No valid amplitude set for analog channel {}",
                chan
            )));
        }
        let (min_len, max_len) = self.constraints.waveform_length;
        if analysis.number_of_samples > max_len {
            return Err(PulsedError::ResourceExceeded {
                what: format!("waveform {} samples", name),
                requested: analysis.number_of_samples,
                limit: max_len,
            });
        }
        if analysis.number_of_samples < min_len {
            return Err(PulsedError::config(format!(
                "{} has {} samples, the hardware needs at least {}",
                name, analysis.number_of_samples, min_len
            )));
        }
        Ok(())
    }

    /// Samples `ensemble` into waveform `waveform_name`.
    ///
    /// `offset_bin` is the global sample offset used for phase continuity when the ensemble is
    /// played in a rotating frame. Returns the offset after this ensemble and the sampling
    /// record. On error no (partial) waveform is left on the generator.
    pub fn sample_ensemble(
        &self,
        ensemble: &PulseBlockEnsemble,
        blocks: &IndexMap<String, PulseBlock>,
        generator: &mut dyn PulseGenerator,
        waveform_name: &str,
        offset_bin: u64,
    ) -> Result<(u64, SamplingInformation)> {
        let mut timer = TickTimer::new();
        let analysis = analyze_ensemble(ensemble, blocks, self.settings.sample_rate)?;
        self.validate(&ensemble.name, &analysis)?;
        timer.tick_log(&format!("{} analyze", ensemble.name));

        let mut writer = ChunkWriter {
            generator,
            name: waveform_name.to_string(),
            chunk_samples: self.chunk_samples.max(1),
            total: analysis.number_of_samples,
            written: 0,
            buffered: 0,
            analog: analysis
                .analog_channels
                .iter()
                .map(|chan| (chan.clone(), Vec::new()))
                .collect(),
            digital: analysis
                .digital_channels
                .iter()
                .map(|chan| (chan.clone(), Vec::new()))
                .collect(),
        };
        let result = self.write_elements(ensemble, blocks, &analysis, &mut writer, offset_bin);
        if let Err(err) = result {
            if writer.written > 0 {
                if let Err(cleanup) = writer.generator.delete_waveform(waveform_name) {
                    tracing::error!(
                        "Failed to remove partial waveform {}: {}",
                        waveform_name,
                        cleanup
                    );
                }
            }
            return Err(err);
        }
        timer.tick_log(&format!("{} sample and write", ensemble.name));

        let new_offset = if ensemble.rotating_frame {
            offset_bin + analysis.number_of_samples
        } else {
            offset_bin
        };
        let info = SamplingInformation {
            number_of_samples: analysis.number_of_samples,
            number_of_elements: analysis.elements_length_bins.len(),
            elements_length_bins: analysis.elements_length_bins,
            digital_rising_bins: analysis.digital_rising_bins,
            digital_falling_bins: analysis.digital_falling_bins,
            analog_channels: analysis.analog_channels,
            digital_channels: analysis.digital_channels,
            pulse_generator_settings: self.settings.clone(),
            waveforms: vec![waveform_name.to_string()],
        };
        Ok((new_offset, info))
    }

    fn write_elements(
        &self,
        ensemble: &PulseBlockEnsemble,
        blocks: &IndexMap<String, PulseBlock>,
        analysis: &EnsembleAnalysis,
        writer: &mut ChunkWriter,
        offset_bin: u64,
    ) -> Result<()> {
        let rate = self.settings.sample_rate;
        let played = playback_order(ensemble, blocks)?;
        let mut element_start: u64 = 0;
        for (p, &n) in played.iter().zip(&analysis.elements_length_bins) {
            let time_origin = if ensemble.rotating_frame {
                offset_bin + element_start
            } else {
                0
            };
            let span = ElementSpan {
                start: time_origin as f64 / rate,
                duration: n.saturating_sub(1) as f64 / rate,
            };
            let mut counter = ChunkCounter::new(n as usize, writer.chunk_samples);
            while !counter.is_done() {
                let (start, end) = counter.tick_next();
                if writer.room() < end - start {
                    writer.flush()?;
                }
                self.fill_element(p.element, &span, time_origin, start, end, writer)?;
            }
            element_start += n;
        }
        writer.flush()?;
        if writer.written != analysis.number_of_samples {
            return Err(PulsedError::hardware(format!(
                "Waveform {}: {} samples written, {} expected",
                writer.name, writer.written, analysis.number_of_samples
            )));
        }
        Ok(())
    }

    /// Appends bins `start..end` of `element` to the writer buffers.
    fn fill_element(
        &self,
        element: &PulseBlockElement,
        span: &ElementSpan,
        time_origin: u64,
        start: usize,
        end: usize,
        writer: &mut ChunkWriter,
    ) -> Result<()> {
        let rate = self.settings.sample_rate;
        let len = end - start;
        for (chan, buf) in writer.analog.iter_mut() {
            let shape = element.pulse_function.get(chan).ok_or_else(|| {
                PulsedError::config(format!("Element has no shape on channel {}", chan))
            })?;
            let amplitude = self.settings.analog_amplitudes.get(chan).copied().unwrap_or(1.0);
            let mut t_arr = Array1::from_shape_fn(len, |i| {
                (time_origin + (start + i) as u64) as f64 / rate
            });
            shape.eval_inplace(self.functions, span, &mut t_arr.view_mut())?;
            for v in t_arr.iter() {
                let normalized = v / amplitude;
                if normalized.abs() > 1.0 + 1e-9 || !normalized.is_finite() {
                    return Err(PulsedError::config(format!(
                        "Shape {} on {} reaches {} V, beyond the {} Vpp amplitude",
                        shape, chan, v, amplitude
                    )));
                }
                buf.push(normalized as f32);
            }
        }
        for (chan, buf) in writer.digital.iter_mut() {
            let high = element.is_high(chan);
            buf.extend(std::iter::repeat(high).take(len));
        }
        writer.buffered += len;
        Ok(())
    }

    /// Samples every ensemble of `sequence` and writes the sequence program.
    ///
    /// Returns the sampling record of the sequence and the records of ensembles whose waveform
    /// carries the ensemble's own name.
    pub fn sample_sequence(
        &self,
        sequence: &PulseSequence,
        ensembles: &IndexMap<String, PulseBlockEnsemble>,
        blocks: &IndexMap<String, PulseBlock>,
        generator: &mut dyn PulseGenerator,
    ) -> Result<(SamplingInformation, Vec<(String, SamplingInformation)>)> {
        if self.constraints.sequence_option == SequenceOption::NonExistent {
            return Err(PulsedError::config(
                "Pulse generator has no sequencer, sequences can not be sampled",
            ));
        }
        if sequence.steps.len() > self.constraints.sequence_steps_max {
            return Err(PulsedError::ResourceExceeded {
                what: format!("sequence {} steps", sequence.name),
                requested: sequence.steps.len() as u64,
                limit: self.constraints.sequence_steps_max as u64,
            });
        }
        for step in &sequence.steps {
            if let Some(option) = step
                .used_options()
                .into_iter()
                .find(|o| !self.constraints.sequence_step_options.contains(*o))
            {
                return Err(PulsedError::config(format!(
                    "Sequence {} uses step option {} unsupported by the hardware",
                    sequence.name, option
                )));
            }
            for jump in step.go_to.iter().chain(step.event_jump_to.iter()) {
                if *jump >= sequence.steps.len() {
                    return Err(PulsedError::config(format!(
                        "Sequence {} jumps to step {} of {}",
                        sequence.name,
                        jump,
                        sequence.steps.len()
                    )));
                }
            }
        }
        // Validate every ensemble before the first write
        for name in sequence.ensemble_names() {
            let ensemble = ensembles
                .get(&name)
                .ok_or_else(|| PulsedError::lookup("pulse block ensembles", &name))?;
            let analysis = analyze_ensemble(ensemble, blocks, self.settings.sample_rate)?;
            self.validate(&name, &analysis)?;
        }

        let mut step_waveforms: Vec<(Vec<String>, SequenceStep)> = Vec::new();
        let mut sampled: IndexMap<String, SamplingInformation> = IndexMap::new();
        let mut offset_bin = 0;
        for (step_no, step) in sequence.steps.iter().enumerate() {
            let ensemble = ensembles
                .get(&step.ensemble)
                .ok_or_else(|| PulsedError::lookup("pulse block ensembles", &step.ensemble))?;
            // In a rotating frame every step needs its own phase-continuous waveform
            let waveform_name = if sequence.rotating_frame {
                format!("{}_{}", ensemble.name, step_no)
            } else {
                ensemble.name.clone()
            };
            if !sampled.contains_key(&waveform_name) {
                let mut frame_ensemble = ensemble.clone();
                frame_ensemble.rotating_frame = sequence.rotating_frame;
                let (next_offset, info) =
                    self.sample_ensemble(&frame_ensemble, blocks, generator, &waveform_name, offset_bin)?;
                offset_bin = next_offset;
                sampled.insert(waveform_name.clone(), info);
            }
            step_waveforms.push((vec![waveform_name], step.clone()));
        }
        generator.write_sequence(&sequence.name, &step_waveforms)?;

        let mut seq_info = SamplingInformation {
            pulse_generator_settings: self.settings.clone(),
            ..Default::default()
        };
        for info in sampled.values() {
            seq_info.number_of_samples += info.number_of_samples;
            seq_info.number_of_elements += info.number_of_elements;
            seq_info.analog_channels.extend(info.analog_channels.iter().cloned());
            seq_info.digital_channels.extend(info.digital_channels.iter().cloned());
            seq_info.waveforms.extend(info.waveforms.iter().cloned());
        }
        let ensemble_infos = sampled
            .into_iter()
            .filter(|(name, _)| ensembles.contains_key(name))
            .collect();
        Ok((seq_info, ensemble_infos))
    }
}
