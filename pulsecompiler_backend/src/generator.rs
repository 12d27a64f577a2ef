//! The generation side: pulse object bookkeeping, compilation and pulse generator asset handling.
//!
//! [`SequenceGenerator`] owns the pulse generator hardware handle, the current
//! [`PulseGeneratorSettings`], all known blocks, ensembles and sequences (mirrored to an
//! [`ObjectStore`] when a storage path is configured) and the sampling function and predefined
//! generator registries.
//!
//! The sampling information invariant is maintained here: an object carries
//! [`SamplingInformation`] exactly while the pulse generator holds the data sampled from its current
//! version. Saving a new version of an object, deleting its waveforms or clearing the device drops
//! the record, and so does saving a block or ensemble an already sampled object depends on.

use std::collections::BTreeSet;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PulsedError, Result};
use crate::hardware::{Constraints, PulseGenerator, SequenceOption};
use crate::params::{ParamSet, ParamSpec};
use crate::predefined::*;
use crate::pulse_objects::*;
use crate::registry::{MethodSelection, Registry};
use crate::sampler::{ensemble_info, sequence_info, EnsembleInfo, EnsembleSampler};
use crate::shapes::{sampling_function_registry, SamplingFunction};
use crate::storage::{ObjectStore, StoredObject};
use crate::utils::is_analog_channel;

/// Default number of samples per `write_waveform` call.
pub const DEFAULT_CHUNK_SAMPLES: usize = 1 << 20;

#[derive(Clone, Debug)]
pub struct GeneratorOptions {
    /// Directory for persisted pulse objects, `None` keeps everything in memory.
    pub storage_path: Option<PathBuf>,
    pub write_chunk_samples: usize,
    pub sampling_function_roots: Vec<String>,
    pub predefined_roots: Vec<String>,
    pub generation_parameters: GenerationParameters,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        GeneratorOptions {
            storage_path: None,
            write_chunk_samples: DEFAULT_CHUNK_SAMPLES,
            sampling_function_roots: Vec::new(),
            predefined_roots: Vec::new(),
            generation_parameters: GenerationParameters::default(),
        }
    }
}

/// Requested changes to the pulse generator settings. `None` fields stay as they are.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsRequest {
    pub activation_config: Option<String>,
    pub sample_rate: Option<f64>,
    pub analog_amplitudes: Option<IndexMap<String, f64>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetKind {
    Ensemble,
    Sequence,
}

/// The object whose data is currently loaded for playback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadedAsset {
    pub name: String,
    pub kind: AssetKind,
}

/// What the measurement side needs to know about a pulse object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssetMetadata {
    pub measurement_information: Option<MeasurementInformation>,
    pub sampling_information: Option<SamplingInformation>,
}

pub struct SequenceGenerator {
    pulser: Box<dyn PulseGenerator>,
    constraints: Constraints,
    settings: PulseGeneratorSettings,
    generation_parameters: GenerationParameters,
    blocks: IndexMap<String, PulseBlock>,
    ensembles: IndexMap<String, PulseBlockEnsemble>,
    sequences: IndexMap<String, PulseSequence>,
    store: Option<ObjectStore>,
    functions: Registry<SamplingFunction>,
    predefined: MethodSelection<PredefinedGenerator>,
    chunk_samples: usize,
    loaded: Option<LoadedAsset>,
}

impl SequenceGenerator {
    /// Takes ownership of `pulser`, reads its current settings and loads stored objects.
    ///
    /// Stored sampling records whose waveforms are no longer on the device are dropped.
    pub fn new(pulser: Box<dyn PulseGenerator>, options: GeneratorOptions) -> Result<Self> {
        let constraints = pulser.get_constraints();
        let active = pulser.active_channels();
        let config_name = constraints
            .activation_config_name(&active)
            .unwrap_or("custom")
            .to_string();
        let settings = PulseGeneratorSettings {
            sample_rate: pulser.sample_rate(),
            activation_config: (config_name, active),
            analog_amplitudes: pulser.analog_amplitudes(),
        };
        let predefined = MethodSelection::new(predefined_registry(&options.predefined_roots), "rabi")?;
        let mut generator = SequenceGenerator {
            pulser,
            constraints,
            settings,
            generation_parameters: options.generation_parameters,
            blocks: IndexMap::new(),
            ensembles: IndexMap::new(),
            sequences: IndexMap::new(),
            store: None,
            functions: sampling_function_registry(&options.sampling_function_roots),
            predefined,
            chunk_samples: options.write_chunk_samples.max(1),
            loaded: None,
        };
        if let Some(path) = options.storage_path {
            let store = ObjectStore::open(path)?;
            generator.blocks = store.load_all()?;
            generator.ensembles = store.load_all()?;
            generator.sequences = store.load_all()?;
            generator.store = Some(store);
            generator.drop_stale_sampling_information()?;
        }
        tracing::info!(
            "Sequence generator ready: {} blocks, {} ensembles, {} sequences",
            generator.blocks.len(),
            generator.ensembles.len(),
            generator.sequences.len()
        );
        Ok(generator)
    }

    fn drop_stale_sampling_information(&mut self) -> Result<()> {
        let mut on_device: BTreeSet<String> = self.pulser.waveform_names().into_iter().collect();
        on_device.extend(self.pulser.sequence_names());
        let stale = |info: &Option<SamplingInformation>| {
            info.as_ref()
                .map_or(false, |i| i.waveforms.iter().any(|w| !on_device.contains(w)))
        };
        let stale_ensembles: Vec<String> = self
            .ensembles
            .values()
            .filter(|e| stale(&e.sampling_information))
            .map(|e| e.name.clone())
            .collect();
        let stale_sequences: Vec<String> = self
            .sequences
            .values()
            .filter(|s| stale(&s.sampling_information) || (s.is_sampled() && !on_device.contains(&s.name)))
            .map(|s| s.name.clone())
            .collect();
        for name in stale_ensembles {
            tracing::debug!("Ensemble {} is no longer on the pulse generator", name);
            self.clear_ensemble_sampling(&name)?;
        }
        for name in stale_sequences {
            tracing::debug!("Sequence {} is no longer on the pulse generator", name);
            self.clear_sequence_sampling(&name)?;
        }
        Ok(())
    }

    fn persist<T: StoredObject>(&self, object: &T) -> Result<()> {
        match &self.store {
            Some(store) => store.save(object),
            None => Ok(()),
        }
    }

    fn unpersist<T: StoredObject>(&self, name: &str) -> Result<()> {
        if let Some(store) = &self.store {
            store.delete::<T>(name)?;
        }
        Ok(())
    }

    fn clear_ensemble_sampling(&mut self, name: &str) -> Result<()> {
        let cleared = match self.ensembles.get_mut(name) {
            Some(ensemble) if ensemble.sampling_information.is_some() => {
                ensemble.sampling_information = None;
                Some(ensemble.clone())
            }
            _ => None,
        };
        if let Some(ensemble) = cleared {
            self.persist(&ensemble)?;
        }
        Ok(())
    }

    fn clear_sequence_sampling(&mut self, name: &str) -> Result<()> {
        let cleared = match self.sequences.get_mut(name) {
            Some(sequence) if sequence.sampling_information.is_some() => {
                sequence.sampling_information = None;
                Some(sequence.clone())
            }
            _ => None,
        };
        if let Some(sequence) = cleared {
            self.persist(&sequence)?;
        }
        if self.loaded.as_ref().map_or(false, |l| l.kind == AssetKind::Sequence && l.name == name) {
            self.loaded = None;
        }
        Ok(())
    }

    /// Drops the sampling records of every sequence playing `ensemble`.
    fn invalidate_sequences_using(&mut self, ensemble: &str) -> Result<()> {
        let users: Vec<String> = self
            .sequences
            .values()
            .filter(|s| s.steps.iter().any(|step| step.ensemble == ensemble))
            .map(|s| s.name.clone())
            .collect();
        for name in users {
            self.clear_sequence_sampling(&name)?;
        }
        Ok(())
    }

    fn invalidate_ensemble(&mut self, name: &str) -> Result<()> {
        self.clear_ensemble_sampling(name)?;
        self.invalidate_sequences_using(name)
    }

    // Pulse objects

    pub fn save_block(&mut self, block: PulseBlock) -> Result<()> {
        if block.name.is_empty() {
            return Err(PulsedError::config("Pulse block name must not be empty"));
        }
        self.persist(&block)?;
        let users: Vec<String> = self
            .ensembles
            .values()
            .filter(|e| e.block_list.iter().any(|(b, _)| *b == block.name))
            .map(|e| e.name.clone())
            .collect();
        self.blocks.insert(block.name.clone(), block);
        for name in users {
            self.invalidate_ensemble(&name)?;
        }
        Ok(())
    }

    pub fn save_ensemble(&mut self, mut ensemble: PulseBlockEnsemble) -> Result<()> {
        if ensemble.name.is_empty() {
            return Err(PulsedError::config("Pulse block ensemble name must not be empty"));
        }
        // Only compilation may attach a sampling record
        ensemble.sampling_information = None;
        self.persist(&ensemble)?;
        let name = ensemble.name.clone();
        self.ensembles.insert(name.clone(), ensemble);
        self.invalidate_sequences_using(&name)
    }

    pub fn save_sequence(&mut self, mut sequence: PulseSequence) -> Result<()> {
        if sequence.name.is_empty() {
            return Err(PulsedError::config("Pulse sequence name must not be empty"));
        }
        sequence.sampling_information = None;
        self.persist(&sequence)?;
        self.sequences.insert(sequence.name.clone(), sequence);
        Ok(())
    }

    pub fn get_block(&self, name: &str) -> Result<PulseBlock> {
        self.blocks
            .get(name)
            .cloned()
            .ok_or_else(|| PulsedError::lookup("pulse blocks", name))
    }

    pub fn get_ensemble(&self, name: &str) -> Result<PulseBlockEnsemble> {
        self.ensembles
            .get(name)
            .cloned()
            .ok_or_else(|| PulsedError::lookup("pulse block ensembles", name))
    }

    pub fn get_sequence(&self, name: &str) -> Result<PulseSequence> {
        self.sequences
            .get(name)
            .cloned()
            .ok_or_else(|| PulsedError::lookup("pulse sequences", name))
    }

    pub fn block_names(&self) -> Vec<String> {
        self.blocks.keys().cloned().collect()
    }

    pub fn ensemble_names(&self) -> Vec<String> {
        self.ensembles.keys().cloned().collect()
    }

    pub fn sequence_names(&self) -> Vec<String> {
        self.sequences.keys().cloned().collect()
    }

    pub fn delete_block(&mut self, name: &str) -> Result<()> {
        self.blocks
            .shift_remove(name)
            .ok_or_else(|| PulsedError::lookup("pulse blocks", name))?;
        self.unpersist::<PulseBlock>(name)
    }

    /// Deletes the ensemble together with its waveforms on the device.
    pub fn delete_ensemble(&mut self, name: &str) -> Result<()> {
        let waveforms = self
            .ensembles
            .get(name)
            .ok_or_else(|| PulsedError::lookup("pulse block ensembles", name))?
            .sampling_information
            .as_ref()
            .map(|info| info.waveforms.clone())
            .unwrap_or_default();
        for waveform in waveforms {
            self.delete_waveform(&waveform)?;
        }
        self.ensembles.shift_remove(name);
        self.unpersist::<PulseBlockEnsemble>(name)
    }

    pub fn delete_sequence(&mut self, name: &str) -> Result<()> {
        let sampled = self
            .sequences
            .get(name)
            .ok_or_else(|| PulsedError::lookup("pulse sequences", name))?
            .is_sampled();
        if sampled {
            self.delete_sequence_asset(name)?;
        }
        self.sequences.shift_remove(name);
        self.unpersist::<PulseSequence>(name)
    }

    // Settings

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn pulse_generator_settings(&self) -> &PulseGeneratorSettings {
        &self.settings
    }

    /// Validates and applies `request`, returning the settings the device reports afterwards.
    pub fn set_pulse_generator_settings(&mut self, request: &SettingsRequest) -> Result<PulseGeneratorSettings> {
        let config = match &request.activation_config {
            Some(name) => {
                let channels = self.constraints.activation_configs.get(name).ok_or_else(|| {
                    PulsedError::config(format!(
                        "Unknown activation config {}, available: {:?}",
                        name,
                        self.constraints.activation_configs.keys().collect::<Vec<_>>()
                    ))
                })?;
                Some((name.clone(), channels.clone()))
            }
            None => None,
        };
        if let Some(rate) = request.sample_rate {
            if !self.constraints.sample_rate_in_range(rate) {
                return Err(PulsedError::config(format!(
                    "Sample rate {:e} outside of hardware range {:e}..{:e}",
                    rate, self.constraints.sample_rate.0, self.constraints.sample_rate.1
                )));
            }
        }
        if let Some(amplitudes) = &request.analog_amplitudes {
            let (min, max) = self.constraints.a_ch_amplitude;
            for (chan, amp) in amplitudes {
                if !is_analog_channel(chan) {
                    return Err(PulsedError::config(format!("{} is not an analog channel", chan)));
                }
                if !(min..=max).contains(amp) {
                    return Err(PulsedError::config(format!(
                        "Amplitude {} V on {} outside of {}..{} V",
                        amp, chan, min, max
                    )));
                }
            }
        }

        if let Some((name, channels)) = config {
            let active = self.pulser.set_active_channels(&channels)?;
            let reported = self
                .constraints
                .activation_config_name(&active)
                .map_or(name, |n| n.to_string());
            self.settings.activation_config = (reported, active);
        }
        if let Some(rate) = request.sample_rate {
            self.settings.sample_rate = self.pulser.set_sample_rate(rate)?;
        }
        if let Some(amplitudes) = &request.analog_amplitudes {
            self.settings.analog_amplitudes = self.pulser.set_analog_amplitudes(amplitudes)?;
        }
        tracing::info!(
            "Pulse generator settings: {} at {:e} Sa/s",
            self.settings.activation_config.0,
            self.settings.sample_rate
        );
        Ok(self.settings.clone())
    }

    pub fn generation_parameters(&self) -> &GenerationParameters {
        &self.generation_parameters
    }

    pub fn set_generation_parameters(&mut self, params: GenerationParameters) {
        self.generation_parameters = params;
    }

    // Compilation

    /// Samples an ensemble into a waveform of the same name and stores the sampling record.
    ///
    /// On hardware that only plays sequences a one-step sequence of the same name is written too.
    pub fn sample_ensemble(&mut self, name: &str) -> Result<SamplingInformation> {
        let ensemble = self.get_ensemble(name)?;
        // The previous version is overwritten, so its record is stale from here on
        self.invalidate_ensemble(name)?;
        let sampler = EnsembleSampler {
            functions: &self.functions,
            settings: &self.settings,
            constraints: &self.constraints,
            chunk_samples: self.chunk_samples,
        };
        let (_, info) = sampler.sample_ensemble(&ensemble, &self.blocks, self.pulser.as_mut(), name, 0)?;

        if self.constraints.sequence_option == SequenceOption::Forced {
            let repetitions = if self.constraints.sequence_step_options.contains("repetitions") {
                StepRepetitions::Infinite
            } else {
                StepRepetitions::Finite(1)
            };
            let step = SequenceStep::new(name, repetitions);
            if let Err(err) = self.pulser.write_sequence(name, &[(vec![name.to_string()], step)]) {
                self.pulser.delete_waveform(name)?;
                return Err(err);
            }
        }

        let mut sampled = ensemble;
        sampled.sampling_information = Some(info.clone());
        self.persist(&sampled)?;
        self.ensembles.insert(name.to_string(), sampled);
        tracing::info!("Sampled ensemble {}: {} samples", name, info.number_of_samples);
        Ok(info)
    }

    /// Samples every ensemble of a sequence and writes the sequence program.
    pub fn sample_sequence(&mut self, name: &str) -> Result<SamplingInformation> {
        let sequence = self.get_sequence(name)?;
        self.clear_sequence_sampling(name)?;
        for ensemble in sequence.ensemble_names() {
            self.clear_ensemble_sampling(&ensemble)?;
        }
        let sampler = EnsembleSampler {
            functions: &self.functions,
            settings: &self.settings,
            constraints: &self.constraints,
            chunk_samples: self.chunk_samples,
        };
        let (info, ensemble_infos) =
            sampler.sample_sequence(&sequence, &self.ensembles, &self.blocks, self.pulser.as_mut())?;

        for (ensemble_name, ensemble_info) in ensemble_infos {
            let updated = match self.ensembles.get_mut(&ensemble_name) {
                Some(ensemble) => {
                    ensemble.sampling_information = Some(ensemble_info);
                    Some(ensemble.clone())
                }
                None => None,
            };
            if let Some(ensemble) = updated {
                self.persist(&ensemble)?;
            }
        }
        let mut sampled = sequence;
        sampled.sampling_information = Some(info.clone());
        self.persist(&sampled)?;
        self.sequences.insert(name.to_string(), sampled);
        tracing::info!("Sampled sequence {}: {} samples", name, info.number_of_samples);
        Ok(info)
    }

    /// Uploads and loads a sampled ensemble for playback.
    pub fn load_ensemble(&mut self, name: &str) -> Result<LoadedAsset> {
        let ensemble = self.get_ensemble(name)?;
        if !ensemble.is_sampled() {
            return Err(PulsedError::config(format!(
                "Ensemble {} has not been sampled, sample it before loading",
                name
            )));
        }
        self.pulser.upload_asset(name)?;
        self.pulser.load_asset(name)?;
        let asset = LoadedAsset {
            name: name.to_string(),
            kind: AssetKind::Ensemble,
        };
        self.loaded = Some(asset.clone());
        Ok(asset)
    }

    pub fn load_sequence(&mut self, name: &str) -> Result<LoadedAsset> {
        let sequence = self.get_sequence(name)?;
        if !sequence.is_sampled() {
            return Err(PulsedError::config(format!(
                "Sequence {} has not been sampled, sample it before loading",
                name
            )));
        }
        self.pulser.upload_asset(name)?;
        self.pulser.load_asset(name)?;
        let asset = LoadedAsset {
            name: name.to_string(),
            kind: AssetKind::Sequence,
        };
        self.loaded = Some(asset.clone());
        Ok(asset)
    }

    pub fn loaded_asset(&self) -> Option<&LoadedAsset> {
        self.loaded.as_ref()
    }

    /// Metadata of the loaded asset, or of the named ensemble or sequence.
    pub fn asset_metadata(&self, name: &str) -> Result<AssetMetadata> {
        if let Some(ensemble) = self.ensembles.get(name) {
            return Ok(AssetMetadata {
                measurement_information: ensemble.measurement_information.clone(),
                sampling_information: ensemble.sampling_information.clone(),
            });
        }
        let sequence = self.get_sequence(name)?;
        Ok(AssetMetadata {
            measurement_information: sequence.measurement_information,
            sampling_information: sequence.sampling_information,
        })
    }

    /// Deletes a waveform from the device and drops every record that referred to it.
    pub fn delete_waveform(&mut self, name: &str) -> Result<Vec<String>> {
        let deleted = self.pulser.delete_waveform(name)?;
        let uses_deleted = |info: &Option<SamplingInformation>| {
            info.as_ref()
                .map_or(false, |i| i.waveforms.iter().any(|w| deleted.contains(w)))
        };
        let ensembles: Vec<String> = self
            .ensembles
            .values()
            .filter(|e| uses_deleted(&e.sampling_information))
            .map(|e| e.name.clone())
            .collect();
        let sequences: Vec<String> = self
            .sequences
            .values()
            .filter(|s| uses_deleted(&s.sampling_information))
            .map(|s| s.name.clone())
            .collect();
        for ensemble in ensembles {
            self.clear_ensemble_sampling(&ensemble)?;
            if self.loaded.as_ref().map_or(false, |l| l.kind == AssetKind::Ensemble && l.name == ensemble) {
                self.loaded = None;
            }
        }
        for sequence in sequences {
            self.clear_sequence_sampling(&sequence)?;
        }
        Ok(deleted)
    }

    pub fn delete_sequence_asset(&mut self, name: &str) -> Result<Vec<String>> {
        let deleted = self.pulser.delete_sequence(name)?;
        for sequence in &deleted {
            self.clear_sequence_sampling(sequence)?;
        }
        Ok(deleted)
    }

    /// Deletes every asset on the device and drops all sampling records.
    pub fn clear_pulser(&mut self) -> Result<()> {
        self.pulser.clear_all()?;
        for name in self.ensemble_names() {
            self.clear_ensemble_sampling(&name)?;
        }
        for name in self.sequence_names() {
            self.clear_sequence_sampling(&name)?;
        }
        self.loaded = None;
        tracing::info!("Cleared pulse generator");
        Ok(())
    }

    pub fn set_output(&mut self, on: bool) -> Result<bool> {
        self.pulser.set_output(on)
    }

    // Registries

    pub fn sampling_functions(&self) -> IndexMap<String, Vec<ParamSpec>> {
        self.functions.schemas()
    }

    pub fn predefined_methods(&self) -> IndexMap<String, Vec<ParamSpec>> {
        self.predefined.registry().schemas()
    }

    /// Last parameters used with predefined method `method`.
    pub fn predefined_parameters(&self, method: &str) -> Result<ParamSet> {
        self.predefined.parameters_of(method)
    }

    /// Runs a predefined generator and stores everything it produced.
    ///
    /// Returns the names of the produced ensembles and sequences.
    pub fn generate_predefined(&mut self, method: &str, name: &str, params: &ParamSet) -> Result<Vec<String>> {
        let request = params.clone().with("method", method);
        let resolved = self.predefined.set_parameters(&request)?;
        let entry = self.predefined.current_entry()?;
        let base = PredefinedBase::new(&self.settings, &self.generation_parameters);
        let objects = (entry.generate)(&base, name, &resolved)?;

        let mut produced = Vec::new();
        for block in objects.blocks {
            self.save_block(block)?;
        }
        for ensemble in objects.ensembles {
            produced.push(ensemble.name.clone());
            self.save_ensemble(ensemble)?;
        }
        for sequence in objects.sequences {
            produced.push(sequence.name.clone());
            self.save_sequence(sequence)?;
        }
        tracing::info!("Generated {:?} with predefined method {}", produced, method);
        Ok(produced)
    }

    // Summaries

    pub fn ensemble_info(&self, name: &str) -> Result<EnsembleInfo> {
        let ensemble = self
            .ensembles
            .get(name)
            .ok_or_else(|| PulsedError::lookup("pulse block ensembles", name))?;
        let p = &self.generation_parameters;
        ensemble_info(
            ensemble,
            &self.blocks,
            self.settings.sample_rate,
            &p.laser_channel,
            p.gate_channel.as_deref(),
        )
    }

    pub fn sequence_info(&self, name: &str) -> Result<EnsembleInfo> {
        let sequence = self
            .sequences
            .get(name)
            .ok_or_else(|| PulsedError::lookup("pulse sequences", name))?;
        let p = &self.generation_parameters;
        sequence_info(
            sequence,
            &self.ensembles,
            &self.blocks,
            self.settings.sample_rate,
            &p.laser_channel,
            p.gate_channel.as_deref(),
        )
    }
}
