//! The pulsed measurement control loop.
//!
//! [`PulsedMeasurement`] owns the fast counter and the optional microwave source. It moves through
//! `Idle -> Running <-> Paused -> Idle` (passing `Stopping` on the way out) and on every
//! [`PulsedMeasurement::tick`] pulls the accumulated trace, extracts laser windows, analyses them
//! and publishes the new result as a [`MeasurementUpdate`].
//!
//! A failed counter read stops the measurement (fail-stop): the counter is halted, the state goes
//! back to `Idle` and the last good result stays available. This holds for timer refreshes and
//! manual [`PulsedMeasurement::refresh`] calls alike. Extraction or analysis failures only skip
//! the current refresh.
//!
//! Raw data of a stopped run can be stashed under a tag. Starting again with the same tag adds the
//! stashed counts, sweeps and time to the new run as long as the data shapes match.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, TrySendError};
use indexmap::IndexMap;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use pulsecompiler_backend::error::{PulsedError, Result};
use pulsecompiler_backend::generator::{AssetMetadata, LoadedAsset};
use pulsecompiler_backend::params::{ParamSet, ParamSpec};
use pulsecompiler_backend::registry::MethodSelection;

use crate::alternative::{compute_alternative_data, AlternativeData, AlternativeDataType};
use crate::analysis::{analysis_registry, AnalysisContext, AnalysisMethod, AnalysisResult};
use crate::asset_guard::AssetGuard;
use crate::export;
use crate::extraction::{extraction_registry, ExtractionContext, ExtractionMethod};
use crate::hardware::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementState {
    Idle,
    Running,
    Paused,
    Stopping,
}

impl MeasurementState {
    pub fn is_active(&self) -> bool {
        !matches!(self, MeasurementState::Idle)
    }
}

/// How the laser pulses of the loaded asset map onto the result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// Take the values below from the loaded asset's measurement information on start.
    pub invoke_settings: bool,
    pub controlled_variable: Vec<f64>,
    pub number_of_lasers: usize,
    /// Negative indices count from the end.
    pub laser_ignore_list: Vec<i64>,
    pub alternating: bool,
    pub units: (String, String),
    pub labels: (String, String),
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        MeasurementSettings {
            invoke_settings: true,
            controlled_variable: (1..=50).map(|i| i as f64).collect(),
            number_of_lasers: 50,
            laser_ignore_list: Vec::new(),
            alternating: false,
            units: ("s".to_string(), "arb. u.".to_string()),
            labels: ("Tau".to_string(), "Signal".to_string()),
        }
    }
}

/// The asset the pulse generator plays, as seen by the measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedAssetInfo {
    pub asset: LoadedAsset,
    pub metadata: AssetMetadata,
    /// Digital channel whose rising edges mark the laser pulses.
    pub edge_channel: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementData {
    pub controlled_variable: Array1<f64>,
    /// One row, or two for alternating sequences.
    pub signal: Array2<f64>,
    pub error: Array2<f64>,
    /// Derived from `signal` according to the selected [`AlternativeDataType`].
    pub alt_data: Option<AlternativeData>,
    pub laser_data: Array2<u64>,
    pub raw_data: CountData,
    /// Seconds.
    pub elapsed_time: f64,
    pub elapsed_sweeps: u64,
    /// Number of refreshes that produced a result.
    pub analysed_refreshes: u64,
}

#[derive(Clone, Debug)]
pub enum MeasurementUpdate {
    State(MeasurementState),
    Data(Box<MeasurementData>),
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct MeasurementOptions {
    pub extraction_roots: Vec<String>,
    pub analysis_roots: Vec<String>,
    /// Used for ungated counters; gated counters start with `gated_conv_deriv`.
    pub extraction_method: String,
    pub analysis_method: String,
    pub timer_interval: Duration,
    /// How long start and resume wait for the loaded asset to finish compiling or uploading.
    pub asset_wait: Duration,
}

impl Default for MeasurementOptions {
    fn default() -> Self {
        MeasurementOptions {
            extraction_roots: Vec::new(),
            analysis_roots: Vec::new(),
            extraction_method: "ungated_threshold".to_string(),
            analysis_method: "mean_norm".to_string(),
            timer_interval: Duration::from_secs(1),
            asset_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
struct StashedRun {
    raw_data: CountData,
    elapsed_sweeps: u64,
    elapsed_time: f64,
}

pub struct PulsedMeasurement {
    counter: Box<dyn FastCounter>,
    microwave: Option<Box<dyn MicrowaveSource>>,
    extraction: MethodSelection<ExtractionMethod>,
    analysis: MethodSelection<AnalysisMethod>,
    settings: MeasurementSettings,
    counter_settings: CounterSettings,
    microwave_settings: MicrowaveSettings,
    asset: Option<LoadedAssetInfo>,
    guard: Arc<AssetGuard>,
    asset_wait: Duration,
    state: MeasurementState,
    data: MeasurementData,
    stash: HashMap<String, StashedRun>,
    recalled: Option<StashedRun>,
    running_since: Option<Instant>,
    elapsed_before: f64,
    timer_interval: Duration,
    alternative_data_type: AlternativeDataType,
    updates: Option<Sender<MeasurementUpdate>>,
}

impl PulsedMeasurement {
    /// Takes ownership of the devices and configures the counter for the default settings.
    pub fn new(
        mut counter: Box<dyn FastCounter>,
        microwave: Option<Box<dyn MicrowaveSource>>,
        guard: Arc<AssetGuard>,
        options: MeasurementOptions,
    ) -> Result<Self> {
        let settings = MeasurementSettings::default();
        let requested = CounterSettings {
            number_of_gates: if counter.is_gated() { settings.number_of_lasers } else { 0 },
            ..Default::default()
        };
        let counter_settings = counter.configure(&requested)?;

        let default_extraction = if counter.is_gated() {
            "gated_conv_deriv"
        } else {
            options.extraction_method.as_str()
        };
        let extraction = MethodSelection::new(extraction_registry(&options.extraction_roots), default_extraction)?;
        let analysis = MethodSelection::new(analysis_registry(&options.analysis_roots), &options.analysis_method)?;

        let data = empty_data(&settings, &counter_settings);
        Ok(PulsedMeasurement {
            counter,
            microwave,
            extraction,
            analysis,
            settings,
            counter_settings,
            microwave_settings: MicrowaveSettings::default(),
            asset: None,
            guard,
            asset_wait: options.asset_wait,
            state: MeasurementState::Idle,
            data,
            stash: HashMap::new(),
            recalled: None,
            running_since: None,
            elapsed_before: 0.0,
            timer_interval: options.timer_interval,
            alternative_data_type: AlternativeDataType::None,
            updates: None,
        })
    }

    pub fn set_update_sender(&mut self, sender: Sender<MeasurementUpdate>) {
        self.updates = Some(sender);
    }

    pub fn state(&self) -> MeasurementState {
        self.state
    }

    pub fn data(&self) -> &MeasurementData {
        &self.data
    }

    pub fn settings(&self) -> &MeasurementSettings {
        &self.settings
    }

    pub fn counter_settings(&self) -> &CounterSettings {
        &self.counter_settings
    }

    pub fn microwave_settings(&self) -> &MicrowaveSettings {
        &self.microwave_settings
    }

    pub fn loaded_asset(&self) -> Option<&LoadedAssetInfo> {
        self.asset.as_ref()
    }

    pub fn timer_interval(&self) -> Duration {
        self.timer_interval
    }

    pub fn alternative_data_type(&self) -> AlternativeDataType {
        self.alternative_data_type
    }

    /// Selects the alternative data view and recomputes it for the current result.
    ///
    /// `Delta` needs an alternating measurement. Requesting it otherwise is refused and a
    /// previously selected `Delta` falls back to `None`.
    pub fn set_alternative_data_type(&mut self, data_type: AlternativeDataType) -> Result<AlternativeDataType> {
        if data_type == AlternativeDataType::Delta && !self.settings.alternating {
            if self.alternative_data_type == AlternativeDataType::Delta {
                self.alternative_data_type = AlternativeDataType::None;
                self.data.alt_data = None;
            }
            return Err(PulsedError::config(format!(
                "Delta alternative data needs an alternating measurement, keeping {:?}",
                self.alternative_data_type
            )));
        }
        self.data.alt_data = self.alternative_data(data_type)?;
        self.alternative_data_type = data_type;
        Ok(data_type)
    }

    fn alternative_data(&self, data_type: AlternativeDataType) -> Result<Option<AlternativeData>> {
        compute_alternative_data(data_type, &self.data.controlled_variable, &self.data.signal)
    }

    /// Writes the current result, laser pulses and raw counts as JSON files tagged `tag` into
    /// `dir`. Returns the written paths.
    pub fn save_measurement_data(&self, dir: &Path, tag: &str) -> Result<Vec<PathBuf>> {
        export::save_measurement_data(dir, tag, &self.data, &self.settings, self.counter_settings.bin_width)
    }

    pub fn stashed_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.stash.keys().cloned().collect();
        tags.sort();
        tags
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        if self.state.is_active() {
            return Err(PulsedError::config(format!(
                "Can not change {} while the measurement is {:?}",
                what, self.state
            )));
        }
        Ok(())
    }

    pub fn set_measurement_settings(&mut self, settings: MeasurementSettings) -> Result<MeasurementSettings> {
        self.ensure_idle("measurement settings")?;
        let mut settings = settings;
        settings.laser_ignore_list.sort_unstable();
        let gates_changed = self.counter.is_gated() && settings.number_of_lasers != self.counter_settings.number_of_gates;
        self.settings = settings;
        if gates_changed {
            let requested = CounterSettings {
                number_of_gates: self.settings.number_of_lasers,
                ..self.counter_settings.clone()
            };
            self.counter_settings = self.counter.configure(&requested)?;
        }
        self.data = empty_data(&self.settings, &self.counter_settings);
        Ok(self.settings.clone())
    }

    pub fn set_counter_settings(&mut self, settings: &CounterSettings) -> Result<CounterSettings> {
        self.ensure_idle("counter settings")?;
        self.counter_settings = self.counter.configure(settings)?;
        tracing::info!(
            "Counter set to {} s bins, {} s record, {} gates",
            self.counter_settings.bin_width,
            self.counter_settings.record_length,
            self.counter_settings.number_of_gates
        );
        self.data = empty_data(&self.settings, &self.counter_settings);
        Ok(self.counter_settings.clone())
    }

    pub fn set_microwave_settings(&mut self, settings: &MicrowaveSettings) -> Result<MicrowaveSettings> {
        self.ensure_idle("microwave settings")?;
        let mut applied = settings.clone();
        if settings.use_ext_microwave {
            let microwave = self
                .microwave
                .as_mut()
                .ok_or_else(|| PulsedError::config("No microwave source is connected"))?;
            let (frequency, power) = microwave.set_cw(settings.frequency, settings.power)?;
            applied.frequency = frequency;
            applied.power = power;
            if let Some(timing) = &settings.trigger_timing {
                applied.trigger_timing = Some(microwave.set_trigger_timing(timing)?);
            }
        }
        self.microwave_settings = applied.clone();
        Ok(applied)
    }

    pub fn extraction_methods(&self) -> IndexMap<String, Vec<ParamSpec>> {
        self.extraction.registry().schemas()
    }

    pub fn extraction_parameters(&self) -> Result<ParamSet> {
        let mut params = self.extraction.current_parameters()?;
        params.insert("method", self.extraction.current_method());
        Ok(params)
    }

    /// Updates the selected extraction method; a `method` key switches it first.
    pub fn set_extraction_parameters(&mut self, params: &ParamSet) -> Result<ParamSet> {
        self.extraction.set_parameters(params)?;
        self.extraction_parameters()
    }

    pub fn analysis_methods(&self) -> IndexMap<String, Vec<ParamSpec>> {
        self.analysis.registry().schemas()
    }

    pub fn analysis_parameters(&self) -> Result<ParamSet> {
        let mut params = self.analysis.current_parameters()?;
        params.insert("method", self.analysis.current_method());
        Ok(params)
    }

    pub fn set_analysis_parameters(&mut self, params: &ParamSet) -> Result<ParamSet> {
        self.analysis.set_parameters(params)?;
        self.analysis_parameters()
    }

    pub fn set_timer_interval(&mut self, seconds: f64) -> Result<Duration> {
        if !(seconds > 0.0) || !seconds.is_finite() {
            return Err(PulsedError::config(format!(
                "Timer interval must be a positive number of seconds, got {}",
                seconds
            )));
        }
        self.timer_interval = Duration::from_secs_f64(seconds);
        Ok(self.timer_interval)
    }

    /// Records the asset now playing. While idle its measurement information is applied right
    /// away if settings are invoked.
    pub fn set_loaded_asset(&mut self, asset: Option<LoadedAssetInfo>) {
        self.asset = asset;
        if self.settings.invoke_settings && !self.state.is_active() {
            let has_info = self
                .asset
                .as_ref()
                .map_or(false, |a| a.metadata.measurement_information.is_some());
            if has_info {
                if let Err(err) = self.invoke_measurement_information() {
                    tracing::warn!("Could not apply measurement information: {}", err);
                }
            }
        }
    }

    fn invoke_measurement_information(&mut self) -> Result<()> {
        let asset = self
            .asset
            .as_ref()
            .ok_or_else(|| PulsedError::config("Invoking settings requires a loaded asset"))?;
        let info = asset.metadata.measurement_information.clone().ok_or_else(|| {
            PulsedError::config(format!(
                "Asset {} carries no measurement information to invoke",
                asset.asset.name
            ))
        })?;
        let mut ignore_list = info.laser_ignore_list.clone();
        ignore_list.sort_unstable();
        self.settings = MeasurementSettings {
            invoke_settings: true,
            controlled_variable: info.controlled_variable.clone(),
            number_of_lasers: info.number_of_lasers,
            laser_ignore_list: ignore_list,
            alternating: info.alternating,
            units: info.units.clone(),
            labels: info.labels.clone(),
        };

        let mut requested = self.counter_settings.clone();
        if info.counting_length > 0.0 {
            requested.record_length = info.counting_length;
        }
        if self.counter.is_gated() {
            requested.number_of_gates = info.number_of_lasers;
        }
        if requested != self.counter_settings {
            self.counter_settings = self.counter.configure(&requested)?;
        }
        self.data = empty_data(&self.settings, &self.counter_settings);
        tracing::debug!("Invoked measurement information of {}", asset.asset.name);
        Ok(())
    }

    fn elapsed_time(&self) -> f64 {
        self.elapsed_before
            + self
                .running_since
                .map_or(0.0, |since| since.elapsed().as_secs_f64())
    }

    fn freeze_elapsed_time(&mut self) {
        self.elapsed_before = self.elapsed_time();
        self.running_since = None;
    }

    fn emit(&self, update: MeasurementUpdate) {
        if let Some(sender) = &self.updates {
            if let Err(TrySendError::Full(_)) = sender.try_send(update) {
                tracing::debug!("Update queue full, dropping an update");
            }
        }
    }

    fn set_state(&mut self, state: MeasurementState) {
        self.state = state;
        self.emit(MeasurementUpdate::State(state));
    }

    fn microwave_switch(&mut self, on: bool) -> Result<()> {
        if !self.microwave_settings.use_ext_microwave {
            return Ok(());
        }
        match self.microwave.as_mut() {
            Some(microwave) if on => microwave.on(),
            Some(microwave) => microwave.off(),
            None => Ok(()),
        }
    }

    /// Waits up to the configured asset wait for the loaded asset to leave the compiler.
    fn ensure_asset_idle(&self) -> Result<()> {
        if let Some(asset) = &self.asset {
            if !self.guard.wait_idle(&asset.asset.name, self.asset_wait) {
                return Err(PulsedError::config(format!(
                    "Asset {} is being compiled or uploaded",
                    asset.asset.name
                )));
            }
        }
        Ok(())
    }

    /// Starts a new run. With a `stash_tag`, data stashed under it earlier is added to this run.
    pub fn start(&mut self, stash_tag: Option<&str>) -> Result<()> {
        self.ensure_idle("the run state")?;
        self.ensure_asset_idle()?;
        if self.settings.invoke_settings {
            self.invoke_measurement_information()?;
        }
        self.warn_on_laser_mismatch();

        self.data = empty_data(&self.settings, &self.counter_settings);
        self.recalled = stash_tag.and_then(|tag| self.stash.get(tag).cloned());
        if let Some(recalled) = &self.recalled {
            tracing::info!(
                "Continuing stashed run {:?} with {} sweeps",
                stash_tag,
                recalled.elapsed_sweeps
            );
        }
        self.elapsed_before = self.recalled.as_ref().map_or(0.0, |r| r.elapsed_time);

        self.microwave_switch(true)?;
        if let Err(err) = self.counter.start() {
            if let Err(off_err) = self.microwave_switch(false) {
                tracing::error!("Microwave did not switch off: {}", off_err);
            }
            return Err(err);
        }
        self.running_since = Some(Instant::now());
        self.set_state(MeasurementState::Running);
        tracing::info!("Measurement started");
        Ok(())
    }

    fn warn_on_laser_mismatch(&self) {
        let ignored = self.settings.laser_ignore_list.len();
        let analysed = self.settings.number_of_lasers.saturating_sub(ignored);
        let factor = if self.settings.alternating { 2 } else { 1 };
        let expected = self.settings.controlled_variable.len() * factor;
        if analysed != expected {
            tracing::warn!(
                "{} analysed lasers do not match {} controlled variable points",
                analysed,
                expected
            );
        }
    }

    /// Runs a last refresh, halts the devices and optionally stashes the raw data.
    pub fn stop(&mut self, stash_tag: Option<&str>) -> Result<()> {
        if self.state == MeasurementState::Idle {
            return Ok(());
        }
        let was_running = self.state == MeasurementState::Running;
        self.set_state(MeasurementState::Stopping);
        if was_running {
            if let Err(err) = self.pull_data_and_analyse() {
                tracing::debug!("Final refresh skipped: {}", err);
            }
        }
        let counter_result = self.counter.stop();
        let microwave_result = self.microwave_switch(false);
        self.freeze_elapsed_time();
        self.data.elapsed_time = self.elapsed_before;

        if let Some(tag) = stash_tag {
            self.stash.insert(
                tag.to_string(),
                StashedRun {
                    raw_data: self.data.raw_data.clone(),
                    elapsed_sweeps: self.data.elapsed_sweeps,
                    elapsed_time: self.data.elapsed_time,
                },
            );
            tracing::debug!("Stashed raw data as {}", tag);
        }
        self.recalled = None;
        self.set_state(MeasurementState::Idle);
        tracing::info!(
            "Measurement stopped after {} sweeps, {:.1} s",
            self.data.elapsed_sweeps,
            self.data.elapsed_time
        );
        counter_result.and(microwave_result)
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.state != MeasurementState::Running {
            return Err(PulsedError::config(format!(
                "Only a running measurement can be paused, it is {:?}",
                self.state
            )));
        }
        if let Err(err) = self.counter.pause().and_then(|_| self.microwave_switch(false)) {
            self.fail_stop(&err);
            return Err(err);
        }
        self.freeze_elapsed_time();
        self.set_state(MeasurementState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != MeasurementState::Paused {
            return Err(PulsedError::config(format!(
                "Only a paused measurement can be resumed, it is {:?}",
                self.state
            )));
        }
        self.ensure_asset_idle()?;
        if let Err(err) = self.microwave_switch(true).and_then(|_| self.counter.resume()) {
            self.fail_stop(&err);
            return Err(err);
        }
        self.running_since = Some(Instant::now());
        self.set_state(MeasurementState::Running);
        Ok(())
    }

    fn fail_stop(&mut self, err: &PulsedError) {
        tracing::error!("Hardware failure, stopping the measurement: {}", err);
        if let Err(stop_err) = self.counter.stop() {
            tracing::error!("Counter did not stop: {}", stop_err);
        }
        if let Err(off_err) = self.microwave_switch(false) {
            tracing::error!("Microwave did not switch off: {}", off_err);
        }
        self.freeze_elapsed_time();
        self.recalled = None;
        self.emit(MeasurementUpdate::Failed(err.to_string()));
        self.set_state(MeasurementState::Idle);
    }

    /// One refresh of a running measurement. Returns whether a new result was produced.
    ///
    /// Hardware errors stop the measurement before they are returned.
    pub fn tick(&mut self) -> Result<bool> {
        if self.state != MeasurementState::Running {
            return Ok(false);
        }
        match self.pull_data_and_analyse() {
            Ok(()) => Ok(true),
            Err(err) if err.is_hardware() => {
                self.fail_stop(&err);
                Err(err)
            }
            Err(err) => {
                tracing::warn!("Refresh skipped, keeping the last result: {}", err);
                self.emit(MeasurementUpdate::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Manual refresh. During a run a hardware error stops the measurement like a timer refresh.
    pub fn refresh(&mut self) -> Result<()> {
        let result = self.pull_data_and_analyse();
        if let Err(err) = &result {
            if err.is_hardware() && self.state.is_active() {
                self.fail_stop(err);
            }
        }
        result
    }

    /// Reads the counter, then extracts and analyses the accumulated data.
    fn pull_data_and_analyse(&mut self) -> Result<()> {
        let trace = self.counter.get_trace()?;
        let mut raw_data = trace.data;
        let mut sweeps = trace.elapsed_sweeps.unwrap_or(self.data.elapsed_sweeps);
        if let Some(recalled) = &self.recalled {
            if raw_data.is_all_zero() {
                raw_data = recalled.raw_data.clone();
                sweeps += recalled.elapsed_sweeps;
            } else if let Some(sum) = raw_data.added(&recalled.raw_data) {
                raw_data = sum;
                sweeps += recalled.elapsed_sweeps;
            } else {
                tracing::warn!(
                    "Stashed data of shape {:?} does not fit the trace of shape {:?}, discarding it",
                    recalled.raw_data.shape(),
                    raw_data.shape()
                );
                self.recalled = None;
            }
        }
        self.data.raw_data = raw_data;
        self.data.elapsed_sweeps = sweeps;
        self.data.elapsed_time = trace.elapsed_time.unwrap_or_else(|| self.elapsed_time());

        let extraction_context = self.extraction_context();
        let extraction_method = self.extraction.current_entry()?;
        let extracted = extraction_method.extract(
            &self.data.raw_data,
            &extraction_context,
            &self.extraction.current_parameters()?,
        )?;

        let number_of_lasers = extracted.laser_counts.nrows();
        let analysed = if extracted.laser_counts.iter().all(|&c| c == 0) {
            AnalysisResult::zeros(number_of_lasers)
        } else {
            self.analysis.current_entry()?.analyse(
                &extracted.laser_counts.view(),
                &AnalysisContext {
                    bin_width: self.counter_settings.bin_width,
                },
                &self.analysis.current_parameters()?,
            )?
        };
        let (signal, error) = self.arrange(&analysed)?;

        self.data.laser_data = extracted.laser_counts;
        self.data.signal = signal;
        self.data.error = error;
        self.data.alt_data = self.alternative_data(self.alternative_data_type).unwrap_or_else(|err| {
            tracing::warn!("No alternative data: {}", err);
            None
        });
        self.data.analysed_refreshes += 1;
        self.emit(MeasurementUpdate::Data(Box::new(self.data.clone())));
        Ok(())
    }

    fn extraction_context(&self) -> ExtractionContext {
        let (sampling_information, edge_channel) = match &self.asset {
            Some(asset) => (
                asset.metadata.sampling_information.as_ref(),
                asset.edge_channel.as_str(),
            ),
            None => (None, ""),
        };
        ExtractionContext::new(
            self.counter_settings.bin_width,
            self.settings.number_of_lasers,
            sampling_information,
            edge_channel,
        )
    }

    /// Drops ignored lasers and splits alternating results into two rows.
    fn arrange(&self, analysed: &AnalysisResult) -> Result<(Array2<f64>, Array2<f64>)> {
        let n = analysed.signal.len() as i64;
        let mut ignored = BTreeSet::new();
        for &idx in &self.settings.laser_ignore_list {
            let resolved = if idx < 0 { n + idx } else { idx };
            if (0..n).contains(&resolved) {
                ignored.insert(resolved as usize);
            } else {
                tracing::warn!("Ignored laser index {} is out of range for {} lasers", idx, n);
            }
        }
        let kept: Vec<usize> = (0..analysed.signal.len()).filter(|i| !ignored.contains(i)).collect();

        let points = self.settings.controlled_variable.len();
        let rows = if self.settings.alternating { 2 } else { 1 };
        if kept.len() != rows * points {
            return Err(PulsedError::Processing(format!(
                "{} analysed lasers do not fit {} controlled variable points{}",
                kept.len(),
                points,
                if self.settings.alternating { " (alternating)" } else { "" }
            )));
        }
        let signal = Array2::from_shape_fn((rows, points), |(row, i)| analysed.signal[kept[i * rows + row]]);
        let error = Array2::from_shape_fn((rows, points), |(row, i)| analysed.error[kept[i * rows + row]]);
        Ok((signal, error))
    }
}

fn empty_data(settings: &MeasurementSettings, counter: &CounterSettings) -> MeasurementData {
    let points = settings.controlled_variable.len();
    let rows = if settings.alternating { 2 } else { 1 };
    let bins = counter.number_of_bins();
    MeasurementData {
        controlled_variable: Array1::from(settings.controlled_variable.clone()),
        signal: Array2::zeros((rows, points)),
        error: Array2::zeros((rows, points)),
        alt_data: None,
        laser_data: Array2::zeros((settings.number_of_lasers, bins)),
        raw_data: CountData::zeros(counter.number_of_gates, bins),
        elapsed_time: 0.0,
        elapsed_sweeps: 0,
        analysed_refreshes: 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dummy_hardware::*;
    use crossbeam::channel::bounded;
    use pulsecompiler_backend::generator::AssetKind;
    use pulsecompiler_backend::pulse_objects::MeasurementInformation;

    const STARTS: [usize; 6] = [50, 200, 350, 500, 650, 800];

    /// Six 100-bin pulses, odd ones twice as bright.
    fn alternating_pattern() -> CountData {
        let mut trace = Array1::zeros(1000);
        for (i, &start) in STARTS.iter().enumerate() {
            let level = if i % 2 == 0 { 10 } else { 20 };
            for bin in start..start + 100 {
                trace[bin] = level;
            }
        }
        CountData::Ungated(trace)
    }

    fn settings(number_of_lasers: usize, points: usize, alternating: bool) -> MeasurementSettings {
        MeasurementSettings {
            invoke_settings: false,
            controlled_variable: (0..points).map(|i| i as f64 * 1e-9).collect(),
            number_of_lasers,
            alternating,
            ..Default::default()
        }
    }

    fn measurement(pattern: CountData) -> (PulsedMeasurement, DummyCounterHandle) {
        let counter = DummyCounter::new(false);
        let handle = counter.handle();
        handle.lock().sweep_pattern = Some(pattern);
        let mut measurement = PulsedMeasurement::new(
            Box::new(counter),
            Some(Box::new(DummyMicrowave::default())),
            AssetGuard::new(),
            MeasurementOptions::default(),
        )
        .unwrap();
        measurement
            .set_counter_settings(&CounterSettings {
                bin_width: 1e-9,
                record_length: 1e-6,
                number_of_gates: 0,
            })
            .unwrap();
        measurement
            .set_analysis_parameters(
                &ParamSet::new()
                    .with("method", "mean")
                    .with("signal_end", 100e-9),
            )
            .unwrap();
        (measurement, handle)
    }

    fn asset(info: Option<MeasurementInformation>) -> LoadedAssetInfo {
        LoadedAssetInfo {
            asset: LoadedAsset {
                name: "rabi".to_string(),
                kind: AssetKind::Ensemble,
            },
            metadata: AssetMetadata {
                measurement_information: info,
                sampling_information: None,
            },
            edge_channel: "d_ch1".to_string(),
        }
    }

    #[test]
    fn stop_mid_run_keeps_the_last_result() {
        let (mut measurement, handle) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        let (tx, rx) = bounded(100);
        measurement.set_update_sender(tx);

        measurement.start(None).unwrap();
        assert_eq!(measurement.state(), MeasurementState::Running);
        assert!(measurement.tick().unwrap());
        assert_eq!(measurement.data().signal.row(0).to_vec(), vec![10.0, 20.0, 10.0, 20.0, 10.0, 20.0]);

        measurement.stop(None).unwrap();
        assert_eq!(measurement.state(), MeasurementState::Idle);
        // The final refresh on stop saw a second sweep
        assert_eq!(measurement.data().elapsed_sweeps, 2);
        assert_eq!(measurement.data().signal[[0, 1]], 40.0);

        let reads = handle.lock().reads;
        assert!(!measurement.tick().unwrap());
        assert_eq!(handle.lock().reads, reads);
        assert_eq!(measurement.data().signal[[0, 1]], 40.0);

        let states: Vec<MeasurementState> = rx
            .try_iter()
            .filter_map(|update| match update {
                MeasurementUpdate::State(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                MeasurementState::Running,
                MeasurementState::Stopping,
                MeasurementState::Idle
            ]
        );
    }

    #[test]
    fn alternating_rows_and_difference() {
        let (mut measurement, _) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 3, true)).unwrap();
        measurement.set_alternative_data_type(AlternativeDataType::Delta).unwrap();
        measurement.start(None).unwrap();
        measurement.tick().unwrap();
        let data = measurement.data();
        assert_eq!(data.signal.shape(), &[2, 3]);
        assert_eq!(data.signal.row(0).to_vec(), vec![10.0; 3]);
        assert_eq!(data.signal.row(1).to_vec(), vec![20.0; 3]);
        let alt = data.alt_data.as_ref().unwrap();
        assert_eq!(alt.data_type, AlternativeDataType::Delta);
        assert_eq!(alt.y.row(0).to_vec(), vec![-10.0; 3]);
    }

    #[test]
    fn alternative_data_follows_the_selected_type() {
        let (mut measurement, _) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        measurement.start(None).unwrap();
        measurement.tick().unwrap();
        assert_eq!(measurement.data().alt_data, None);

        // Delta needs two rows
        assert!(matches!(
            measurement.set_alternative_data_type(AlternativeDataType::Delta),
            Err(PulsedError::Configuration(_))
        ));
        assert_eq!(measurement.alternative_data_type(), AlternativeDataType::None);

        // Switching recomputes the current result right away
        measurement.set_alternative_data_type(AlternativeDataType::Fft).unwrap();
        let alt = measurement.data().alt_data.clone().unwrap();
        assert_eq!(alt.x.len(), 3);
        assert!((alt.x[1] - 1.0 / 6e-9).abs() < 1.0);
        // 10, 20, 10, ... oscillates at the Nyquist frequency, outside the kept half
        assert!(alt.y.iter().all(|m| m.abs() < 1e-9));

        measurement.tick().unwrap();
        assert_eq!(
            measurement.data().alt_data.as_ref().map(|alt| alt.data_type),
            Some(AlternativeDataType::Fft)
        );
        measurement.set_alternative_data_type(AlternativeDataType::None).unwrap();
        assert_eq!(measurement.data().alt_data, None);
    }

    #[test]
    fn saved_data_reads_back() {
        let (mut measurement, _) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 3, true)).unwrap();
        measurement.set_alternative_data_type(AlternativeDataType::Delta).unwrap();
        measurement.start(None).unwrap();
        measurement.tick().unwrap();
        measurement.stop(None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("run");
        let paths = measurement.save_measurement_data(&target, "t1").unwrap();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["t1_pulsed_measurement.json", "t1_laser_pulses.json", "t1_raw_timetrace.json"]
        );

        let record: crate::export::PulsedMeasurementRecord =
            serde_json::from_str(&std::fs::read_to_string(&paths[0]).unwrap()).unwrap();
        assert_eq!(record.signal, vec![vec![20.0; 3], vec![40.0; 3]]);
        assert_eq!(record.alternative_data_type, AlternativeDataType::Delta);
        assert_eq!(record.alternative_y, vec![vec![-20.0; 3]]);
        assert_eq!(record.elapsed_sweeps, 2);
        assert!(record.alternating);

        let lasers: crate::export::LaserPulsesRecord =
            serde_json::from_str(&std::fs::read_to_string(&paths[1]).unwrap()).unwrap();
        assert_eq!(lasers.laser_data.len(), 6);
        assert_eq!(lasers.bin_width, 1e-9);

        let raw: crate::export::RawTimetraceRecord =
            serde_json::from_str(&std::fs::read_to_string(&paths[2]).unwrap()).unwrap();
        assert!(!raw.gated);
        assert_eq!(raw.counts.len(), 1);
        assert_eq!(raw.counts[0][50], 20);

        assert!(matches!(
            measurement.save_measurement_data(&target, "../escape"),
            Err(PulsedError::Configuration(_))
        ));
    }

    #[test]
    fn ignored_lasers_are_dropped() {
        let (mut measurement, _) = measurement(alternating_pattern());
        let mut s = settings(6, 4, false);
        s.laser_ignore_list = vec![-1, 0];
        measurement.set_measurement_settings(s).unwrap();
        measurement.start(None).unwrap();
        measurement.tick().unwrap();
        assert_eq!(measurement.data().signal.row(0).to_vec(), vec![20.0, 10.0, 20.0, 10.0]);
    }

    #[test]
    fn length_mismatch_keeps_the_last_result() {
        let (mut measurement, _) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 5, false)).unwrap();
        measurement.start(None).unwrap();
        assert!(matches!(measurement.tick(), Err(PulsedError::Processing(_))));
        assert_eq!(measurement.state(), MeasurementState::Running);
        assert_eq!(measurement.data().analysed_refreshes, 0);
    }

    #[test]
    fn hardware_failure_stops_the_run() {
        let (mut measurement, handle) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        let (tx, rx) = bounded(100);
        measurement.set_update_sender(tx);
        handle.lock().fail_from_read = Some(2);

        measurement.start(None).unwrap();
        measurement.tick().unwrap();
        let err = measurement.tick().unwrap_err();
        assert!(err.is_hardware());
        assert_eq!(measurement.state(), MeasurementState::Idle);
        assert_eq!(measurement.data().signal[[0, 0]], 10.0);
        assert_eq!(handle.lock().call_log.last().map(String::as_str), Some("stop"));
        assert!(rx
            .try_iter()
            .any(|update| matches!(update, MeasurementUpdate::Failed(_))));
    }

    #[test]
    fn manual_refresh_failure_stops_the_run() {
        let (mut measurement, handle) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        measurement.start(None).unwrap();
        measurement.refresh().unwrap();
        assert_eq!(measurement.data().analysed_refreshes, 1);

        handle.lock().fail_from_read = Some(0);
        assert!(measurement.refresh().unwrap_err().is_hardware());
        assert_eq!(measurement.state(), MeasurementState::Idle);
        assert!(!handle.lock().running);
        assert_eq!(measurement.data().analysed_refreshes, 1);

        // Paused runs fail the same way
        handle.lock().fail_from_read = None;
        measurement.start(None).unwrap();
        measurement.pause().unwrap();
        handle.lock().fail_from_read = Some(0);
        assert!(measurement.refresh().unwrap_err().is_hardware());
        assert_eq!(measurement.state(), MeasurementState::Idle);
        assert!(!handle.lock().running);

        // An idle refresh only reports the error
        assert!(measurement.refresh().unwrap_err().is_hardware());
        assert_eq!(measurement.state(), MeasurementState::Idle);
    }

    #[test]
    fn stashed_data_is_added_to_the_next_run() {
        let (mut measurement, _) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        measurement.start(None).unwrap();
        measurement.tick().unwrap();
        measurement.stop(Some("run1")).unwrap();
        assert_eq!(measurement.stashed_tags(), vec!["run1"]);

        measurement.start(Some("run1")).unwrap();
        measurement.tick().unwrap();
        assert_eq!(measurement.data().elapsed_sweeps, 3);
        assert_eq!(measurement.data().signal[[0, 0]], 30.0);

        measurement.stop(None).unwrap();
        measurement.start(None).unwrap();
        measurement.tick().unwrap();
        assert_eq!(measurement.data().elapsed_sweeps, 1);
    }

    #[test]
    fn pause_and_resume() {
        let (mut measurement, handle) = measurement(alternating_pattern());
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        assert!(measurement.pause().is_err());
        measurement.start(None).unwrap();
        measurement.pause().unwrap();
        assert_eq!(measurement.state(), MeasurementState::Paused);
        assert!(!measurement.tick().unwrap());
        assert!(measurement.set_timer_interval(0.5).is_ok());
        assert!(measurement.set_counter_settings(&CounterSettings::default()).is_err());
        measurement.resume().unwrap();
        assert_eq!(measurement.state(), MeasurementState::Running);
        let log = handle.lock().call_log.clone();
        assert!(log.ends_with(&["pause".to_string(), "resume".to_string()]));
    }

    #[test]
    fn invoked_settings_come_from_the_asset() {
        let (mut measurement, handle) = measurement(alternating_pattern());
        measurement.set_loaded_asset(Some(asset(Some(MeasurementInformation {
            alternating: false,
            laser_ignore_list: vec![],
            controlled_variable: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            number_of_lasers: 6,
            counting_length: 1.2e-6,
            ..Default::default()
        }))));
        assert_eq!(measurement.settings().number_of_lasers, 6);
        assert_eq!(measurement.counter_settings().record_length, 1.2e-6);
        assert_eq!(measurement.data().controlled_variable.len(), 6);
        assert_eq!(handle.lock().settings.record_length, 1.2e-6);

        measurement.start(None).unwrap();
        assert!(measurement.tick().unwrap());
    }

    #[test]
    fn invoking_without_information_fails_the_start() {
        let (mut measurement, _) = measurement(alternating_pattern());
        measurement.set_loaded_asset(Some(asset(None)));
        assert!(matches!(measurement.start(None), Err(PulsedError::Configuration(_))));
        assert_eq!(measurement.state(), MeasurementState::Idle);
    }

    fn guarded_measurement(asset_wait: Duration) -> (PulsedMeasurement, Arc<AssetGuard>) {
        let guard = AssetGuard::new();
        let mut measurement = PulsedMeasurement::new(
            Box::new(DummyCounter::default()),
            None,
            guard.clone(),
            MeasurementOptions {
                asset_wait,
                ..Default::default()
            },
        )
        .unwrap();
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        measurement.set_loaded_asset(Some(asset(None)));
        (measurement, guard)
    }

    #[test]
    fn start_waits_for_busy_assets() {
        let (mut measurement, guard) = guarded_measurement(Duration::from_millis(20));
        let busy = guard.begin("rabi");
        assert!(matches!(measurement.start(None), Err(PulsedError::Configuration(_))));
        assert_eq!(measurement.state(), MeasurementState::Idle);
        drop(busy);
        measurement.start(None).unwrap();
    }

    #[test]
    fn start_goes_ahead_once_the_upload_finishes() {
        let (mut measurement, guard) = guarded_measurement(Duration::from_secs(10));
        let busy = guard.begin("rabi");
        let uploader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(busy);
        });
        measurement.start(None).unwrap();
        assert_eq!(measurement.state(), MeasurementState::Running);
        uploader.join().unwrap();
    }

    #[test]
    fn resume_waits_for_busy_assets() {
        let (mut measurement, guard) = guarded_measurement(Duration::from_millis(20));
        measurement.start(None).unwrap();
        measurement.pause().unwrap();

        let busy = guard.begin("rabi");
        assert!(matches!(measurement.resume(), Err(PulsedError::Configuration(_))));
        assert_eq!(measurement.state(), MeasurementState::Paused);
        drop(busy);
        measurement.resume().unwrap();
        assert_eq!(measurement.state(), MeasurementState::Running);
    }

    #[test]
    fn microwave_follows_the_run() {
        let microwave = DummyMicrowave::default();
        let mw = microwave.handle();
        let mut measurement = PulsedMeasurement::new(
            Box::new(DummyCounter::default()),
            Some(Box::new(microwave)),
            AssetGuard::new(),
            MeasurementOptions::default(),
        )
        .unwrap();
        measurement.set_measurement_settings(settings(6, 6, false)).unwrap();
        let applied = measurement
            .set_microwave_settings(&MicrowaveSettings {
                use_ext_microwave: true,
                frequency: 2.8e9,
                power: 40.0,
                trigger_timing: Some(TriggerTiming {
                    edge: TriggerEdge::Rising,
                    delay: 0.0,
                }),
            })
            .unwrap();
        assert_eq!(applied.power, 25.0);
        measurement.start(None).unwrap();
        assert!(mw.lock().on);
        measurement.stop(None).unwrap();
        assert!(!mw.lock().on);
        assert!(mw.lock().trigger_timing.is_some());
    }

    #[test]
    fn gated_counters_get_one_gate_per_laser() {
        let counter = DummyCounter::new(true);
        let handle = counter.handle();
        let mut measurement =
            PulsedMeasurement::new(Box::new(counter), None, AssetGuard::new(), MeasurementOptions::default()).unwrap();
        assert_eq!(measurement.extraction_parameters().unwrap().str("method").unwrap(), "gated_conv_deriv");
        measurement.set_measurement_settings(settings(10, 10, false)).unwrap();
        assert_eq!(handle.lock().settings.number_of_gates, 10);
        assert_eq!(measurement.data().raw_data.shape(), vec![10, 3000]);
    }
}
