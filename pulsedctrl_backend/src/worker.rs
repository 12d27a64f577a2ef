//! Worker threads owning the hardware.
//!
//! [`GeneratorWorker`] owns the [`SequenceGenerator`] (and with it the pulse generator), while
//! [`MeasurementWorker`] owns the [`PulsedMeasurement`] (counter and microwave source). Each one
//! drains a bounded command queue; every command carries the sender its result is returned on.
//!
//! The two workers talk to each other through the same queues: the generator worker tells the
//! measurement worker which asset is loaded, and the measurement worker switches the pulse
//! generator output on and off together with the run. A loaded asset change is queued for the
//! measurement worker before the caller gets the reply of the command that caused it, so a
//! measurement started right after `sample_and_load` sees the new asset.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use indexmap::IndexMap;

use pulsecompiler_backend::error::Result;
use pulsecompiler_backend::generator::{AssetKind, LoadedAsset, SequenceGenerator, SettingsRequest};
use pulsecompiler_backend::params::{ParamSet, ParamSpec};
use pulsecompiler_backend::predefined::GenerationParameters;
use pulsecompiler_backend::pulse_objects::*;
use pulsecompiler_backend::sampler::EnsembleInfo;

use crate::alternative::AlternativeDataType;
use crate::asset_guard::AssetGuard;
use crate::hardware::{CounterSettings, MicrowaveSettings};
use crate::measurement::*;

/// Where a worker sends the result of one command.
pub type Reply<T> = Sender<Result<T>>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectNames {
    pub blocks: Vec<String>,
    pub ensembles: Vec<String>,
    pub sequences: Vec<String>,
}

/// Commands understood by the [`GeneratorWorker`].
pub enum GeneratorCommand {
    SaveBlock(PulseBlock, Reply<()>),
    SaveEnsemble(PulseBlockEnsemble, Reply<()>),
    SaveSequence(PulseSequence, Reply<()>),
    GetBlock(String, Reply<PulseBlock>),
    GetEnsemble(String, Reply<PulseBlockEnsemble>),
    GetSequence(String, Reply<PulseSequence>),
    DeleteBlock(String, Reply<()>),
    DeleteEnsemble(String, Reply<()>),
    DeleteSequence(String, Reply<()>),
    ObjectNames(Reply<ObjectNames>),
    Settings(Reply<PulseGeneratorSettings>),
    SetSettings(SettingsRequest, Reply<PulseGeneratorSettings>),
    SetGenerationParameters(GenerationParameters, Reply<()>),
    /// Compile an ensemble or sequence, optionally loading it right after.
    Sample {
        name: String,
        kind: AssetKind,
        load: bool,
        reply: Reply<SamplingInformation>,
    },
    Load {
        name: String,
        kind: AssetKind,
        reply: Reply<LoadedAsset>,
    },
    DeleteWaveform(String, Reply<Vec<String>>),
    ClearPulser(Reply<()>),
    SetOutput(bool, Reply<bool>),
    PredefinedMethods(Reply<IndexMap<String, Vec<ParamSpec>>>),
    GeneratePredefined {
        method: String,
        name: String,
        params: ParamSet,
        reply: Reply<Vec<String>>,
    },
    InspectEnsemble(String, Reply<EnsembleInfo>),
    Shutdown,
}

/// Commands understood by the [`MeasurementWorker`].
pub enum MeasurementCommand {
    Start {
        stash_tag: Option<String>,
        reply: Reply<()>,
    },
    Stop {
        stash_tag: Option<String>,
        reply: Reply<()>,
    },
    Pause(Reply<()>),
    Resume(Reply<()>),
    /// Refresh now instead of waiting for the timer. Fails the run like a timer refresh would.
    Refresh(Reply<MeasurementData>),
    Data(Reply<MeasurementData>),
    State(Reply<MeasurementState>),
    GetSettings(Reply<MeasurementSettings>),
    SetSettings(MeasurementSettings, Reply<MeasurementSettings>),
    SetCounterSettings(CounterSettings, Reply<CounterSettings>),
    SetMicrowaveSettings(MicrowaveSettings, Reply<MicrowaveSettings>),
    ExtractionMethods(Reply<IndexMap<String, Vec<ParamSpec>>>),
    SetExtractionParameters(ParamSet, Reply<ParamSet>),
    AnalysisMethods(Reply<IndexMap<String, Vec<ParamSpec>>>),
    SetAnalysisParameters(ParamSet, Reply<ParamSet>),
    SetTimerInterval(f64, Reply<Duration>),
    SetAlternativeDataType(AlternativeDataType, Reply<AlternativeDataType>),
    /// Write the current result into `dir`, returning the written files.
    SaveData {
        dir: PathBuf,
        tag: String,
        reply: Reply<Vec<PathBuf>>,
    },
    /// Sent by the generator worker whenever the loaded asset changes.
    SetLoadedAsset(Option<LoadedAssetInfo>),
    Shutdown,
}

fn reply<T>(tx: Reply<T>, result: Result<T>) {
    if let Err(err) = &result {
        tracing::debug!("Command failed: {}", err);
    }
    if tx.send(result).is_err() {
        tracing::debug!("Caller dropped its reply channel");
    }
}

type Deferred = Box<dyn FnOnce()>;

fn deferred<T: 'static>(tx: Reply<T>, result: Result<T>) -> Deferred {
    Box::new(move || reply(tx, result))
}

fn spawn_named(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new().name(name.to_string()).spawn(body)?)
}

pub struct GeneratorWorker {
    generator: SequenceGenerator,
    command_rx: Receiver<GeneratorCommand>,
    guard: Arc<AssetGuard>,
    measurement_tx: Option<Sender<MeasurementCommand>>,
    forwarded: Option<LoadedAssetInfo>,
}

impl GeneratorWorker {
    pub fn new(
        generator: SequenceGenerator,
        command_rx: Receiver<GeneratorCommand>,
        guard: Arc<AssetGuard>,
        measurement_tx: Option<Sender<MeasurementCommand>>,
    ) -> Self {
        GeneratorWorker {
            generator,
            command_rx,
            guard,
            measurement_tx,
            forwarded: None,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        spawn_named("pulse-generator", move || self.run())
    }

    pub fn run(mut self) {
        tracing::info!("Generator worker started");
        loop {
            match self.command_rx.recv() {
                Ok(GeneratorCommand::Shutdown) | Err(_) => break,
                Ok(command) => {
                    let answer = self.handle_command(command);
                    self.forward_loaded_asset();
                    answer();
                }
            }
        }
        if let Err(err) = self.generator.set_output(false) {
            tracing::warn!("Could not switch the pulse generator off: {}", err);
        }
        tracing::info!("Generator worker stopped");
    }

    /// Runs `command` and returns its reply, to be sent once the measurement worker has heard of
    /// any loaded asset change the command caused.
    fn handle_command(&mut self, command: GeneratorCommand) -> Deferred {
        let generator = &mut self.generator;
        match command {
            GeneratorCommand::SaveBlock(block, tx) => deferred(tx, generator.save_block(block)),
            GeneratorCommand::SaveEnsemble(ensemble, tx) => deferred(tx, generator.save_ensemble(ensemble)),
            GeneratorCommand::SaveSequence(sequence, tx) => deferred(tx, generator.save_sequence(sequence)),
            GeneratorCommand::GetBlock(name, tx) => deferred(tx, generator.get_block(&name)),
            GeneratorCommand::GetEnsemble(name, tx) => deferred(tx, generator.get_ensemble(&name)),
            GeneratorCommand::GetSequence(name, tx) => deferred(tx, generator.get_sequence(&name)),
            GeneratorCommand::DeleteBlock(name, tx) => deferred(tx, generator.delete_block(&name)),
            GeneratorCommand::DeleteEnsemble(name, tx) => deferred(tx, generator.delete_ensemble(&name)),
            GeneratorCommand::DeleteSequence(name, tx) => deferred(tx, generator.delete_sequence(&name)),
            GeneratorCommand::ObjectNames(tx) => deferred(
                tx,
                Ok(ObjectNames {
                    blocks: generator.block_names(),
                    ensembles: generator.ensemble_names(),
                    sequences: generator.sequence_names(),
                }),
            ),
            GeneratorCommand::Settings(tx) => deferred(tx, Ok(generator.pulse_generator_settings().clone())),
            GeneratorCommand::SetSettings(request, tx) => {
                deferred(tx, generator.set_pulse_generator_settings(&request))
            }
            GeneratorCommand::SetGenerationParameters(params, tx) => {
                generator.set_generation_parameters(params);
                deferred(tx, Ok(()))
            }
            GeneratorCommand::Sample {
                name,
                kind,
                load,
                reply: tx,
            } => {
                let _busy = self.guard.begin(&name);
                let result = match kind {
                    AssetKind::Ensemble => generator.sample_ensemble(&name),
                    AssetKind::Sequence => generator.sample_sequence(&name),
                };
                let result = match result {
                    Ok(info) if load => load_asset(generator, &name, kind).map(|_| info),
                    other => other,
                };
                deferred(tx, result)
            }
            GeneratorCommand::Load { name, kind, reply: tx } => {
                let _busy = self.guard.begin(&name);
                deferred(tx, load_asset(generator, &name, kind))
            }
            GeneratorCommand::DeleteWaveform(name, tx) => deferred(tx, generator.delete_waveform(&name)),
            GeneratorCommand::ClearPulser(tx) => deferred(tx, generator.clear_pulser()),
            GeneratorCommand::SetOutput(on, tx) => deferred(tx, generator.set_output(on)),
            GeneratorCommand::PredefinedMethods(tx) => deferred(tx, Ok(generator.predefined_methods())),
            GeneratorCommand::GeneratePredefined {
                method,
                name,
                params,
                reply: tx,
            } => deferred(tx, generator.generate_predefined(&method, &name, &params)),
            GeneratorCommand::InspectEnsemble(name, tx) => deferred(tx, generator.ensemble_info(&name)),
            GeneratorCommand::Shutdown => Box::new(|| {}),
        }
    }

    /// Tells the measurement worker about a changed loaded asset or changed asset metadata.
    fn forward_loaded_asset(&mut self) {
        let current = self.generator.loaded_asset().cloned().and_then(|asset| {
            let metadata = self.generator.asset_metadata(&asset.name).ok()?;
            let params = self.generator.generation_parameters();
            let edge_channel = params
                .gate_channel
                .clone()
                .unwrap_or_else(|| params.laser_channel.clone());
            Some(LoadedAssetInfo {
                asset,
                metadata,
                edge_channel,
            })
        });
        if current == self.forwarded {
            return;
        }
        if let Some(tx) = &self.measurement_tx {
            if tx.send(MeasurementCommand::SetLoadedAsset(current.clone())).is_err() {
                tracing::debug!("Measurement worker is gone, loaded asset not forwarded");
            }
        }
        self.forwarded = current;
    }
}

fn load_asset(generator: &mut SequenceGenerator, name: &str, kind: AssetKind) -> Result<LoadedAsset> {
    match kind {
        AssetKind::Ensemble => generator.load_ensemble(name),
        AssetKind::Sequence => generator.load_sequence(name),
    }
}

pub struct MeasurementWorker {
    measurement: PulsedMeasurement,
    command_rx: Receiver<MeasurementCommand>,
    generator_tx: Option<Sender<GeneratorCommand>>,
    next_tick: Option<Instant>,
}

impl MeasurementWorker {
    pub fn new(
        measurement: PulsedMeasurement,
        command_rx: Receiver<MeasurementCommand>,
        generator_tx: Option<Sender<GeneratorCommand>>,
    ) -> Self {
        MeasurementWorker {
            measurement,
            command_rx,
            generator_tx,
            next_tick: None,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        spawn_named("pulsed-measurement", move || self.run())
    }

    /// Handles commands and, while the measurement runs, refreshes at the timer interval.
    pub fn run(mut self) {
        tracing::info!("Measurement worker started");
        loop {
            let command = match self.next_tick {
                Some(deadline) => match self.command_rx.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.command_rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };
            match command {
                Some(MeasurementCommand::Shutdown) => break,
                Some(command) => self.handle_command(command),
                None => self.on_tick(),
            }
        }
        if self.measurement.state().is_active() {
            if let Err(err) = self.measurement.stop(None) {
                tracing::warn!("Measurement did not stop cleanly: {}", err);
            }
            self.switch_pulser(false);
        }
        tracing::info!("Measurement worker stopped");
    }

    fn schedule(&mut self) {
        self.next_tick = match self.measurement.state() {
            MeasurementState::Running => Some(Instant::now() + self.measurement.timer_interval()),
            _ => None,
        };
    }

    fn on_tick(&mut self) {
        if let Err(err) = self.measurement.tick() {
            if err.is_hardware() {
                self.switch_pulser(false);
            }
        }
        self.schedule();
    }

    /// Fire-and-forget output switch on the generator worker.
    fn switch_pulser(&self, on: bool) {
        let Some(tx) = &self.generator_tx else {
            return;
        };
        let (reply_tx, _) = bounded(1);
        match tx.try_send(GeneratorCommand::SetOutput(on, reply_tx)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Generator queue full, pulse generator output not switched")
            }
            Err(TrySendError::Disconnected(_)) => tracing::debug!("Generator worker is gone"),
        }
    }

    fn handle_command(&mut self, command: MeasurementCommand) {
        let measurement = &mut self.measurement;
        match command {
            MeasurementCommand::Start { stash_tag, reply: tx } => {
                let result = measurement.start(stash_tag.as_deref());
                if result.is_ok() {
                    self.switch_pulser(true);
                }
                reply(tx, result);
            }
            MeasurementCommand::Stop { stash_tag, reply: tx } => {
                let was_active = measurement.state().is_active();
                let result = measurement.stop(stash_tag.as_deref());
                if was_active {
                    self.switch_pulser(false);
                }
                reply(tx, result);
            }
            MeasurementCommand::Pause(tx) => {
                let result = measurement.pause();
                if measurement.state() != MeasurementState::Running {
                    self.switch_pulser(false);
                }
                reply(tx, result);
            }
            MeasurementCommand::Resume(tx) => {
                let result = measurement.resume();
                if result.is_ok() {
                    self.switch_pulser(true);
                } else if !measurement.state().is_active() {
                    self.switch_pulser(false);
                }
                reply(tx, result);
            }
            MeasurementCommand::Refresh(tx) => {
                let was_active = measurement.state().is_active();
                let result = measurement.refresh().map(|_| measurement.data().clone());
                if was_active && !measurement.state().is_active() {
                    self.switch_pulser(false);
                }
                reply(tx, result);
            }
            MeasurementCommand::SetAlternativeDataType(data_type, tx) => {
                reply(tx, measurement.set_alternative_data_type(data_type))
            }
            MeasurementCommand::SaveData { dir, tag, reply: tx } => {
                reply(tx, measurement.save_measurement_data(&dir, &tag))
            }
            MeasurementCommand::Data(tx) => reply(tx, Ok(measurement.data().clone())),
            MeasurementCommand::State(tx) => reply(tx, Ok(measurement.state())),
            MeasurementCommand::GetSettings(tx) => reply(tx, Ok(measurement.settings().clone())),
            MeasurementCommand::SetSettings(settings, tx) => {
                reply(tx, measurement.set_measurement_settings(settings))
            }
            MeasurementCommand::SetCounterSettings(settings, tx) => {
                reply(tx, measurement.set_counter_settings(&settings))
            }
            MeasurementCommand::SetMicrowaveSettings(settings, tx) => {
                reply(tx, measurement.set_microwave_settings(&settings))
            }
            MeasurementCommand::ExtractionMethods(tx) => reply(tx, Ok(measurement.extraction_methods())),
            MeasurementCommand::SetExtractionParameters(params, tx) => {
                reply(tx, measurement.set_extraction_parameters(&params))
            }
            MeasurementCommand::AnalysisMethods(tx) => reply(tx, Ok(measurement.analysis_methods())),
            MeasurementCommand::SetAnalysisParameters(params, tx) => {
                reply(tx, measurement.set_analysis_parameters(&params))
            }
            MeasurementCommand::SetTimerInterval(seconds, tx) => {
                reply(tx, measurement.set_timer_interval(seconds))
            }
            MeasurementCommand::SetLoadedAsset(asset) => measurement.set_loaded_asset(asset),
            MeasurementCommand::Shutdown => {}
        }
        // A changed interval or run state takes effect from the next tick on
        if self.measurement.state() != MeasurementState::Running {
            self.next_tick = None;
        } else if self.next_tick.is_none() {
            self.schedule();
        }
    }
}
