//! Single call surface over the generator and measurement workers.
//!
//! Every method turns the call into a command on the owning worker's queue and returns as soon as
//! the command is accepted, handing back a [`Pending`] for the result. Callers that want to wait
//! for the hardware use [`Pending::wait`] or one of the `*_blocking` wrappers.
//!
//! A full queue blocks the caller for at most the configured reply timeout; a worker that does not
//! answer within that time is reported as a [`PulsedError::HardwareCommunication`]. Sampling,
//! loading and predefined generation wait for the longer compile timeout instead, a large
//! sequence can take minutes to compile and upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use indexmap::IndexMap;

use pulsecompiler_backend::error::{PulsedError, Result};
use pulsecompiler_backend::generator::{AssetKind, LoadedAsset, SequenceGenerator, SettingsRequest};
use pulsecompiler_backend::hardware::PulseGenerator;
use pulsecompiler_backend::params::{ParamSet, ParamSpec};
use pulsecompiler_backend::predefined::GenerationParameters;
use pulsecompiler_backend::pulse_objects::*;
use pulsecompiler_backend::sampler::EnsembleInfo;

use crate::alternative::AlternativeDataType;
use crate::asset_guard::AssetGuard;
use crate::config::PulsedConfig;
use crate::hardware::{CounterSettings, FastCounter, MicrowaveSettings, MicrowaveSource};
use crate::measurement::*;
use crate::worker::*;

/// Result of an accepted command, delivered once the worker has run it.
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
    timeout: Duration,
    what: &'static str,
}

impl<T> Pending<T> {
    /// Waits up to the timeout of the command kind: the compile timeout for sampling, loading and
    /// predefined generation, the reply timeout for everything else.
    pub fn wait(self) -> Result<T> {
        let timeout = self.timeout;
        self.wait_timeout(timeout)
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PulsedError::hardware(format!(
                "{} got no reply within {:?}",
                self.what, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(PulsedError::hardware(format!(
                "{} was dropped before its worker replied",
                self.what
            ))),
        }
    }

    /// The result if it is already there.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

pub struct Coordinator {
    generator_tx: Sender<GeneratorCommand>,
    measurement_tx: Sender<MeasurementCommand>,
    updates_rx: Receiver<MeasurementUpdate>,
    guard: Arc<AssetGuard>,
    reply_timeout: Duration,
    compile_timeout: Duration,
    data_dir: Option<PathBuf>,
    measurement_worker: Option<JoinHandle<()>>,
    generator_worker: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Builds the generator and measurement from `config`, moves every device into its worker
    /// thread and starts both workers.
    pub fn spawn(
        pulser: Box<dyn PulseGenerator>,
        counter: Box<dyn FastCounter>,
        microwave: Option<Box<dyn MicrowaveSource>>,
        config: &PulsedConfig,
    ) -> Result<Self> {
        let guard = AssetGuard::new();
        let generator = SequenceGenerator::new(pulser, config.generator_options())?;
        let mut measurement = PulsedMeasurement::new(counter, microwave, guard.clone(), config.measurement_options())?;

        let (generator_tx, generator_rx) = bounded(config.queue_capacity);
        let (measurement_tx, measurement_rx) = bounded(config.queue_capacity);
        let (updates_tx, updates_rx) = bounded(config.queue_capacity);
        measurement.set_update_sender(updates_tx);

        let generator_worker =
            GeneratorWorker::new(generator, generator_rx, guard.clone(), Some(measurement_tx.clone())).spawn()?;
        let measurement_worker = MeasurementWorker::new(measurement, measurement_rx, Some(generator_tx.clone())).spawn()?;
        tracing::info!("Coordinator started");

        Ok(Coordinator {
            generator_tx,
            measurement_tx,
            updates_rx,
            guard,
            reply_timeout: config.reply_timeout(),
            compile_timeout: config.compile_timeout(),
            data_dir: config.data_dir(),
            measurement_worker: Some(measurement_worker),
            generator_worker: Some(generator_worker),
        })
    }

    /// Measurement state changes, results and failures, in the order they happened.
    pub fn updates(&self) -> Receiver<MeasurementUpdate> {
        self.updates_rx.clone()
    }

    pub fn asset_guard(&self) -> Arc<AssetGuard> {
        self.guard.clone()
    }

    fn submit<C, T>(
        &self,
        queue: &Sender<C>,
        what: &'static str,
        timeout: Duration,
        command: impl FnOnce(Reply<T>) -> C,
    ) -> Result<Pending<T>> {
        let (tx, rx) = bounded(1);
        queue
            .send_timeout(command(tx), self.reply_timeout)
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => {
                    PulsedError::hardware(format!("{} was not accepted, the worker queue is full", what))
                }
                SendTimeoutError::Disconnected(_) => {
                    PulsedError::hardware(format!("{} was not accepted, the worker has stopped", what))
                }
            })?;
        Ok(Pending { rx, timeout, what })
    }

    fn generator<T>(&self, what: &'static str, command: impl FnOnce(Reply<T>) -> GeneratorCommand) -> Result<Pending<T>> {
        self.submit(&self.generator_tx, what, self.reply_timeout, command)
    }

    /// A generator command that may compile or upload, waited for with the compile timeout.
    fn compile<T>(&self, what: &'static str, command: impl FnOnce(Reply<T>) -> GeneratorCommand) -> Result<Pending<T>> {
        self.submit(&self.generator_tx, what, self.compile_timeout, command)
    }

    fn measurement<T>(
        &self,
        what: &'static str,
        command: impl FnOnce(Reply<T>) -> MeasurementCommand,
    ) -> Result<Pending<T>> {
        self.submit(&self.measurement_tx, what, self.reply_timeout, command)
    }

    // Pulse objects

    pub fn save_block(&self, block: PulseBlock) -> Result<Pending<()>> {
        self.generator("save_block", |tx| GeneratorCommand::SaveBlock(block, tx))
    }

    pub fn save_ensemble(&self, ensemble: PulseBlockEnsemble) -> Result<Pending<()>> {
        self.generator("save_ensemble", |tx| GeneratorCommand::SaveEnsemble(ensemble, tx))
    }

    pub fn save_sequence(&self, sequence: PulseSequence) -> Result<Pending<()>> {
        self.generator("save_sequence", |tx| GeneratorCommand::SaveSequence(sequence, tx))
    }

    pub fn get_block(&self, name: &str) -> Result<Pending<PulseBlock>> {
        self.generator("get_block", |tx| GeneratorCommand::GetBlock(name.to_string(), tx))
    }

    pub fn get_ensemble(&self, name: &str) -> Result<Pending<PulseBlockEnsemble>> {
        self.generator("get_ensemble", |tx| GeneratorCommand::GetEnsemble(name.to_string(), tx))
    }

    pub fn get_sequence(&self, name: &str) -> Result<Pending<PulseSequence>> {
        self.generator("get_sequence", |tx| GeneratorCommand::GetSequence(name.to_string(), tx))
    }

    pub fn delete_block(&self, name: &str) -> Result<Pending<()>> {
        self.generator("delete_block", |tx| GeneratorCommand::DeleteBlock(name.to_string(), tx))
    }

    pub fn delete_ensemble(&self, name: &str) -> Result<Pending<()>> {
        self.generator("delete_ensemble", |tx| GeneratorCommand::DeleteEnsemble(name.to_string(), tx))
    }

    pub fn delete_sequence(&self, name: &str) -> Result<Pending<()>> {
        self.generator("delete_sequence", |tx| GeneratorCommand::DeleteSequence(name.to_string(), tx))
    }

    pub fn object_names(&self) -> Result<Pending<ObjectNames>> {
        self.generator("object_names", GeneratorCommand::ObjectNames)
    }

    // Pulse generator

    pub fn pulse_generator_settings(&self) -> Result<Pending<PulseGeneratorSettings>> {
        self.generator("pulse_generator_settings", GeneratorCommand::Settings)
    }

    pub fn set_pulse_generator_settings(&self, request: SettingsRequest) -> Result<Pending<PulseGeneratorSettings>> {
        self.generator("set_pulse_generator_settings", |tx| GeneratorCommand::SetSettings(request, tx))
    }

    pub fn set_generation_parameters(&self, params: GenerationParameters) -> Result<Pending<()>> {
        self.generator("set_generation_parameters", |tx| {
            GeneratorCommand::SetGenerationParameters(params, tx)
        })
    }

    pub fn sample_ensemble(&self, name: &str) -> Result<Pending<SamplingInformation>> {
        self.sample(name, AssetKind::Ensemble, false)
    }

    pub fn sample_sequence(&self, name: &str) -> Result<Pending<SamplingInformation>> {
        self.sample(name, AssetKind::Sequence, false)
    }

    /// Compiles and then loads the asset for playback.
    pub fn sample_and_load(&self, name: &str, kind: AssetKind) -> Result<Pending<SamplingInformation>> {
        self.sample(name, kind, true)
    }

    fn sample(&self, name: &str, kind: AssetKind, load: bool) -> Result<Pending<SamplingInformation>> {
        self.compile("sample", |reply| GeneratorCommand::Sample {
            name: name.to_string(),
            kind,
            load,
            reply,
        })
    }

    pub fn load_ensemble(&self, name: &str) -> Result<Pending<LoadedAsset>> {
        self.load(name, AssetKind::Ensemble)
    }

    pub fn load_sequence(&self, name: &str) -> Result<Pending<LoadedAsset>> {
        self.load(name, AssetKind::Sequence)
    }

    fn load(&self, name: &str, kind: AssetKind) -> Result<Pending<LoadedAsset>> {
        self.compile("load", |reply| GeneratorCommand::Load {
            name: name.to_string(),
            kind,
            reply,
        })
    }

    pub fn delete_waveform(&self, name: &str) -> Result<Pending<Vec<String>>> {
        self.generator("delete_waveform", |tx| GeneratorCommand::DeleteWaveform(name.to_string(), tx))
    }

    pub fn clear_pulser(&self) -> Result<Pending<()>> {
        self.generator("clear_pulser", GeneratorCommand::ClearPulser)
    }

    pub fn set_output(&self, on: bool) -> Result<Pending<bool>> {
        self.generator("set_output", |tx| GeneratorCommand::SetOutput(on, tx))
    }

    pub fn predefined_methods(&self) -> Result<Pending<IndexMap<String, Vec<ParamSpec>>>> {
        self.generator("predefined_methods", GeneratorCommand::PredefinedMethods)
    }

    pub fn generate_predefined(&self, method: &str, name: &str, params: ParamSet) -> Result<Pending<Vec<String>>> {
        self.compile("generate_predefined", |reply| GeneratorCommand::GeneratePredefined {
            method: method.to_string(),
            name: name.to_string(),
            params,
            reply,
        })
    }

    pub fn ensemble_info(&self, name: &str) -> Result<Pending<EnsembleInfo>> {
        self.generator("ensemble_info", |tx| GeneratorCommand::InspectEnsemble(name.to_string(), tx))
    }

    // Measurement

    pub fn start_measurement(&self, stash_tag: Option<&str>) -> Result<Pending<()>> {
        self.measurement("start_measurement", |reply| MeasurementCommand::Start {
            stash_tag: stash_tag.map(str::to_string),
            reply,
        })
    }

    pub fn stop_measurement(&self, stash_tag: Option<&str>) -> Result<Pending<()>> {
        self.measurement("stop_measurement", |reply| MeasurementCommand::Stop {
            stash_tag: stash_tag.map(str::to_string),
            reply,
        })
    }

    pub fn pause_measurement(&self) -> Result<Pending<()>> {
        self.measurement("pause_measurement", MeasurementCommand::Pause)
    }

    pub fn resume_measurement(&self) -> Result<Pending<()>> {
        self.measurement("resume_measurement", MeasurementCommand::Resume)
    }

    pub fn refresh(&self) -> Result<Pending<MeasurementData>> {
        self.measurement("refresh", MeasurementCommand::Refresh)
    }

    pub fn measurement_data(&self) -> Result<Pending<MeasurementData>> {
        self.measurement("measurement_data", MeasurementCommand::Data)
    }

    pub fn measurement_state(&self) -> Result<Pending<MeasurementState>> {
        self.measurement("measurement_state", MeasurementCommand::State)
    }

    pub fn measurement_settings(&self) -> Result<Pending<MeasurementSettings>> {
        self.measurement("measurement_settings", MeasurementCommand::GetSettings)
    }

    pub fn set_measurement_settings(&self, settings: MeasurementSettings) -> Result<Pending<MeasurementSettings>> {
        self.measurement("set_measurement_settings", |tx| MeasurementCommand::SetSettings(settings, tx))
    }

    pub fn set_counter_settings(&self, settings: CounterSettings) -> Result<Pending<CounterSettings>> {
        self.measurement("set_counter_settings", |tx| MeasurementCommand::SetCounterSettings(settings, tx))
    }

    pub fn set_microwave_settings(&self, settings: MicrowaveSettings) -> Result<Pending<MicrowaveSettings>> {
        self.measurement("set_microwave_settings", |tx| {
            MeasurementCommand::SetMicrowaveSettings(settings, tx)
        })
    }

    pub fn extraction_methods(&self) -> Result<Pending<IndexMap<String, Vec<ParamSpec>>>> {
        self.measurement("extraction_methods", MeasurementCommand::ExtractionMethods)
    }

    pub fn set_extraction_parameters(&self, params: ParamSet) -> Result<Pending<ParamSet>> {
        self.measurement("set_extraction_parameters", |tx| {
            MeasurementCommand::SetExtractionParameters(params, tx)
        })
    }

    pub fn analysis_methods(&self) -> Result<Pending<IndexMap<String, Vec<ParamSpec>>>> {
        self.measurement("analysis_methods", MeasurementCommand::AnalysisMethods)
    }

    pub fn set_analysis_parameters(&self, params: ParamSet) -> Result<Pending<ParamSet>> {
        self.measurement("set_analysis_parameters", |tx| {
            MeasurementCommand::SetAnalysisParameters(params, tx)
        })
    }

    pub fn set_timer_interval(&self, seconds: f64) -> Result<Pending<Duration>> {
        self.measurement("set_timer_interval", |tx| MeasurementCommand::SetTimerInterval(seconds, tx))
    }

    pub fn set_alternative_data_type(&self, data_type: AlternativeDataType) -> Result<Pending<AlternativeDataType>> {
        self.measurement("set_alternative_data_type", |tx| {
            MeasurementCommand::SetAlternativeDataType(data_type, tx)
        })
    }

    /// Saves the current result under `tag`, into `dir` or the configured data directory.
    pub fn save_measurement_data(&self, tag: &str, dir: Option<&Path>) -> Result<Pending<Vec<PathBuf>>> {
        let dir = dir
            .map(Path::to_path_buf)
            .or_else(|| self.data_dir.clone())
            .ok_or_else(|| PulsedError::config("No directory given and no data_path or storage_path configured"))?;
        self.measurement("save_measurement_data", |reply| MeasurementCommand::SaveData {
            dir,
            tag: tag.to_string(),
            reply,
        })
    }

    // Blocking variants

    pub fn set_pulse_generator_settings_blocking(&self, request: SettingsRequest) -> Result<PulseGeneratorSettings> {
        self.set_pulse_generator_settings(request)?.wait()
    }

    pub fn generate_predefined_blocking(&self, method: &str, name: &str, params: ParamSet) -> Result<Vec<String>> {
        self.generate_predefined(method, name, params)?.wait()
    }

    pub fn sample_and_load_blocking(&self, name: &str, kind: AssetKind) -> Result<SamplingInformation> {
        self.sample_and_load(name, kind)?.wait()
    }

    pub fn start_measurement_blocking(&self, stash_tag: Option<&str>) -> Result<()> {
        self.start_measurement(stash_tag)?.wait()
    }

    pub fn stop_measurement_blocking(&self, stash_tag: Option<&str>) -> Result<()> {
        self.stop_measurement(stash_tag)?.wait()
    }

    pub fn measurement_data_blocking(&self) -> Result<MeasurementData> {
        self.measurement_data()?.wait()
    }

    pub fn measurement_state_blocking(&self) -> Result<MeasurementState> {
        self.measurement_state()?.wait()
    }

    /// Stops a running measurement, then both workers, and joins their threads.
    pub fn shutdown(mut self) -> Result<()> {
        self.join_workers()
    }

    fn join_workers(&mut self) -> Result<()> {
        let mut result = Ok(());
        // The measurement worker goes first so it can still switch the pulse generator off
        if let Some(worker) = self.measurement_worker.take() {
            result = stop_worker(
                "measurement",
                &self.measurement_tx,
                MeasurementCommand::Shutdown,
                worker,
                self.reply_timeout,
            );
        }
        if let Some(worker) = self.generator_worker.take() {
            let generator_result = stop_worker(
                "generator",
                &self.generator_tx,
                GeneratorCommand::Shutdown,
                worker,
                self.reply_timeout,
            );
            result = result.and(generator_result);
        }
        tracing::info!("Coordinator stopped");
        result
    }
}

/// Queues `shutdown` and joins the worker. A worker whose queue stays full is left detached
/// instead of joined, since it would not see the shutdown before draining its backlog.
fn stop_worker<C>(
    name: &str,
    tx: &Sender<C>,
    shutdown: C,
    worker: JoinHandle<()>,
    timeout: Duration,
) -> Result<()> {
    match tx.send_timeout(shutdown, timeout) {
        // A disconnected queue means the worker already left its loop
        Ok(()) | Err(SendTimeoutError::Disconnected(_)) => {}
        Err(SendTimeoutError::Timeout(_)) => {
            tracing::error!(
                "The {} worker did not accept the shutdown within {:?}, leaving it detached",
                name,
                timeout
            );
            return Err(PulsedError::hardware(format!("{} worker did not shut down", name)));
        }
    }
    worker
        .join()
        .map_err(|_| PulsedError::hardware(format!("{} worker panicked", name)))
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.measurement_worker.is_some() || self.generator_worker.is_some() {
            if let Err(err) = self.join_workers() {
                tracing::error!("{}", err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pending_reports_missing_replies() {
        let (tx, rx) = bounded::<Result<u32>>(1);
        let pending = Pending {
            rx: rx.clone(),
            timeout: Duration::from_millis(10),
            what: "ping",
        };
        assert!(pending.try_result().is_none());
        assert!(pending.wait().unwrap_err().is_hardware());

        tx.send(Ok(7)).unwrap();
        let pending = Pending {
            rx,
            timeout: Duration::from_millis(10),
            what: "ping",
        };
        assert_eq!(pending.wait_timeout(Duration::from_secs(1)).unwrap(), 7);

        let (tx, rx) = bounded::<Result<u32>>(1);
        drop(tx);
        let pending = Pending {
            rx,
            timeout: Duration::from_secs(1),
            what: "ping",
        };
        assert!(pending.wait().unwrap_err().is_hardware());
    }

    #[test]
    fn compile_commands_wait_longer() {
        let config = PulsedConfig {
            reply_timeout_s: 0.05,
            compile_timeout_s: 5.0,
            ..Default::default()
        };
        let coordinator = Coordinator::spawn(
            Box::new(pulsecompiler_backend::dummy_pulser::DummyPulser::default()),
            Box::new(crate::dummy_hardware::DummyCounter::new(false)),
            None,
            &config,
        )
        .unwrap();
        let pending = coordinator.sample_ensemble("missing").unwrap();
        assert_eq!(pending.timeout, Duration::from_secs(5));
        assert!(matches!(pending.wait(), Err(PulsedError::Lookup { .. })));
        let pending = coordinator
            .generate_predefined("rabi", "rabi", ParamSet::new())
            .unwrap();
        assert_eq!(pending.timeout, Duration::from_secs(5));
        assert_eq!(coordinator.object_names().unwrap().timeout, Duration::from_millis(50));
        coordinator.shutdown().unwrap();
    }

    #[test]
    fn shutdown_gives_up_on_a_full_queue() {
        let (tx, rx) = bounded::<u32>(1);
        tx.send(0).unwrap();
        let (release_tx, release_rx) = bounded::<()>(1);
        let worker = std::thread::spawn(move || {
            let _ = release_rx.recv();
            drop(rx);
        });
        let started = std::time::Instant::now();
        let result = stop_worker("stuck", &tx, 1, worker, Duration::from_millis(20));
        assert!(result.unwrap_err().is_hardware());
        assert!(started.elapsed() < Duration::from_secs(5));
        release_tx.send(()).unwrap();

        // A worker that already left is joined without waiting
        let (tx, rx) = bounded::<u32>(1);
        let worker = std::thread::spawn(move || drop(rx));
        std::thread::sleep(Duration::from_millis(20));
        assert!(stop_worker("gone", &tx, 1, worker, Duration::from_millis(20)).is_ok());
    }
}
