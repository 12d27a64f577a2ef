//! Predefined generators: measurement recipes producing ready-to-compile pulse objects.
//!
//! A generator is called with an object name and its parameter set and returns the blocks,
//! ensembles and sequences it created. It reads, but never changes, the current pulse generator
//! settings and [`GenerationParameters`] through a [`PredefinedBase`], which also provides the
//! element building blocks shared by all recipes (laser, gate, delay, sync trigger, microwave).
//! Every produced ensemble carries [`MeasurementInformation`] so the measurement side can be
//! configured from it.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PulsedError, Result};
use crate::params::{ParamSet, ParamSpec};
use crate::pulse_objects::*;
use crate::registry::{PluginModule, PluginRoot, Registry, BUILTIN_ROOT};
use crate::shapes::ShapeDescriptor;
use crate::utils::{is_analog_channel, is_digital_channel};

/// Length of the sync trigger element, seconds.
pub const SYNC_LENGTH: f64 = 50e-9;

/// Device-level measurement parameters shared by all predefined generators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    pub laser_channel: String,
    pub sync_channel: Option<String>,
    pub gate_channel: Option<String>,
    pub microwave_channel: String,
    pub microwave_frequency: f64,
    /// Peak amplitude, volts.
    pub microwave_amplitude: f64,
    pub laser_length: f64,
    pub laser_delay: f64,
    pub wait_time: f64,
    pub rabi_period: f64,
    /// Level used when the laser channel is analog, volts.
    pub analog_trigger_voltage: f64,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        GenerationParameters {
            laser_channel: "d_ch1".to_string(),
            sync_channel: None,
            gate_channel: None,
            microwave_channel: "a_ch1".to_string(),
            microwave_frequency: 2.87e9,
            microwave_amplitude: 0.25,
            laser_length: 3e-6,
            laser_delay: 500e-9,
            wait_time: 1e-6,
            rabi_period: 200e-9,
            analog_trigger_voltage: 0.0,
        }
    }
}

/// Everything one generator call produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeneratedObjects {
    pub blocks: Vec<PulseBlock>,
    pub ensembles: Vec<PulseBlockEnsemble>,
    pub sequences: Vec<PulseSequence>,
}

pub type GenerateFn = fn(&PredefinedBase, &str, &ParamSet) -> Result<GeneratedObjects>;

pub struct PredefinedGenerator {
    pub name: String,
    pub schema: Vec<ParamSpec>,
    pub generate: GenerateFn,
}
crate::impl_registry_entry!(PredefinedGenerator);

/// Read-only view of the device settings plus element helpers.
pub struct PredefinedBase<'a> {
    pub settings: &'a PulseGeneratorSettings,
    pub params: &'a GenerationParameters,
}

impl<'a> PredefinedBase<'a> {
    pub fn new(settings: &'a PulseGeneratorSettings, params: &'a GenerationParameters) -> Self {
        PredefinedBase { settings, params }
    }

    fn active(&self) -> &BTreeSet<String> {
        &self.settings.activation_config.1
    }

    pub fn analog_channels(&self) -> Vec<String> {
        self.active()
            .iter()
            .filter(|ch| is_analog_channel(ch))
            .cloned()
            .collect()
    }

    pub fn digital_channels(&self) -> Vec<String> {
        self.active()
            .iter()
            .filter(|ch| is_digital_channel(ch))
            .cloned()
            .collect()
    }

    /// Fails unless every channel the recipes refer to is active.
    pub fn check_channels(&self) -> Result<()> {
        let p = self.params;
        let mut required = vec![&p.laser_channel, &p.microwave_channel];
        required.extend(p.sync_channel.iter());
        required.extend(p.gate_channel.iter());
        match required.into_iter().find(|ch| !self.active().contains(*ch)) {
            Some(ch) => Err(PulsedError::config(format!(
                "Channel {} used by the generation parameters is not active",
                ch
            ))),
            None => Ok(()),
        }
    }

    /// Element with all analog channels idle and the given digital channels high.
    pub fn element(&self, length: f64, increment: f64, high: &[&str], laser_on: bool) -> PulseBlockElement {
        let pulse_function: IndexMap<String, ShapeDescriptor> = self
            .analog_channels()
            .into_iter()
            .map(|ch| (ch, ShapeDescriptor::idle()))
            .collect();
        let digital_high = self
            .digital_channels()
            .into_iter()
            .map(|ch| {
                let is_high = high.contains(&ch.as_str());
                (ch, is_high)
            })
            .collect();
        PulseBlockElement::new(length, increment, pulse_function, digital_high, laser_on)
    }

    pub fn idle_element(&self, length: f64, increment: f64) -> PulseBlockElement {
        self.element(length, increment, &[], false)
    }

    fn with_laser(&self, mut element: PulseBlockElement) -> PulseBlockElement {
        let laser = &self.params.laser_channel;
        if is_analog_channel(laser) {
            element.pulse_function.insert(
                laser.clone(),
                ShapeDescriptor::dc(self.params.analog_trigger_voltage),
            );
        } else {
            element.digital_high.insert(laser.clone(), true);
        }
        element.laser_on = true;
        element
    }

    fn with_gate(&self, mut element: PulseBlockElement) -> PulseBlockElement {
        if let Some(gate) = &self.params.gate_channel {
            element.digital_high.insert(gate.clone(), true);
        }
        element
    }

    pub fn laser_element(&self, length: f64, increment: f64) -> PulseBlockElement {
        self.with_laser(self.idle_element(length, increment))
    }

    /// Laser element that also opens the counter gate.
    pub fn laser_gate_element(&self, length: f64, increment: f64) -> PulseBlockElement {
        self.with_gate(self.laser_element(length, increment))
    }

    /// Idle element lasting `laser_delay`.
    pub fn delay_element(&self) -> PulseBlockElement {
        self.idle_element(self.params.laser_delay, 0.0)
    }

    /// Delay element keeping the counter gate open.
    pub fn delay_gate_element(&self) -> PulseBlockElement {
        self.with_gate(self.delay_element())
    }

    pub fn sync_element(&self) -> PulseBlockElement {
        let mut element = self.idle_element(SYNC_LENGTH, 0.0);
        if let Some(sync) = &self.params.sync_channel {
            element.digital_high.insert(sync.clone(), true);
        }
        element
    }

    /// Microwave pulse: a high level on a digital channel, a sine on an analog one.
    pub fn mw_element(&self, length: f64, increment: f64, amp: f64, freq: f64, phase: f64) -> PulseBlockElement {
        let mut element = self.idle_element(length, increment);
        let mw = &self.params.microwave_channel;
        if is_digital_channel(mw) {
            element.digital_high.insert(mw.clone(), true);
        } else {
            element
                .pulse_function
                .insert(mw.clone(), ShapeDescriptor::sin(amp, freq, phase));
        }
        element
    }

    pub fn mw_laser_element(&self, length: f64, increment: f64, amp: f64, freq: f64, phase: f64) -> PulseBlockElement {
        self.with_laser(self.mw_element(length, increment, amp, freq, phase))
    }

    fn pi_element(&self, fraction: f64, phase: f64) -> PulseBlockElement {
        let p = self.params;
        self.mw_element(p.rabi_period * fraction, 0.0, p.microwave_amplitude, p.microwave_frequency, phase)
    }

    /// 3pi/2 pulse: a phase-flipped pi/2 pulse on analog channels, a longer pulse on digital ones.
    fn pi3half_element(&self) -> PulseBlockElement {
        if is_analog_channel(&self.params.microwave_channel) {
            self.pi_element(0.25, 180.0)
        } else {
            self.pi_element(0.75, 0.0)
        }
    }

    /// Laser, delay and wait elements closing every measurement block.
    pub fn readout_elements(&self) -> Vec<PulseBlockElement> {
        vec![
            self.laser_gate_element(self.params.laser_length, 0.0),
            self.delay_gate_element(),
            self.idle_element(self.params.wait_time, 0.0),
        ]
    }

    /// Appends a sync trigger block to `ensemble` if a sync channel is configured.
    pub fn add_trigger(&self, objects: &mut GeneratedObjects, ensemble: &mut PulseBlockEnsemble) {
        if self.params.sync_channel.is_some() {
            let sync_block = PulseBlock::new("sync_trigger", vec![self.sync_element()]);
            ensemble.append(&sync_block.name, 1);
            objects.blocks.push(sync_block);
        }
    }

    /// Counter record length needed for `ensemble`.
    ///
    /// With a gate channel only one laser pulse plus delay is recorded per gate, otherwise the
    /// whole ensemble.
    pub fn ensemble_count_length(&self, ensemble: &PulseBlockEnsemble, blocks: &[PulseBlock]) -> Result<f64> {
        if self.params.gate_channel.is_some() {
            return Ok(self.params.laser_length + self.params.laser_delay);
        }
        let mut length = 0.0;
        for (block_name, reps) in &ensemble.block_list {
            let block = blocks
                .iter()
                .find(|b| &b.name == block_name)
                .ok_or_else(|| PulsedError::lookup("generated blocks", block_name))?;
            length += block.total_length_s(*reps);
        }
        Ok(length)
    }

    pub fn add_metadata(
        &self,
        objects: &GeneratedObjects,
        ensemble: &mut PulseBlockEnsemble,
        info: MeasurementInformation,
    ) -> Result<()> {
        let counting_length = self.ensemble_count_length(ensemble, &objects.blocks)?;
        ensemble.measurement_information = Some(MeasurementInformation {
            counting_length,
            ..info
        });
        Ok(())
    }

    /// Wraps one block into an ensemble with trigger and metadata.
    fn finish(
        &self,
        name: &str,
        block: PulseBlock,
        reps: usize,
        rotating_frame: bool,
        info: MeasurementInformation,
    ) -> Result<GeneratedObjects> {
        let mut objects = GeneratedObjects::default();
        let mut ensemble = PulseBlockEnsemble::new(name, vec![(block.name.clone(), reps)], rotating_frame);
        objects.blocks.push(block);
        self.add_trigger(&mut objects, &mut ensemble);
        self.add_metadata(&objects, &mut ensemble, info)?;
        objects.ensembles.push(ensemble);
        Ok(objects)
    }
}

fn linspace_steps(start: f64, step: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| start + i as f64 * step).collect()
}

fn tau_info(taus: Vec<f64>, alternating: bool) -> MeasurementInformation {
    let number_of_lasers = if alternating { 2 * taus.len() } else { taus.len() };
    MeasurementInformation {
        alternating,
        controlled_variable: taus,
        units: ("s".to_string(), String::new()),
        labels: ("Tau".to_string(), "Signal".to_string()),
        number_of_lasers,
        ..Default::default()
    }
}

fn generate_laser_on(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let block = PulseBlock::new(name, vec![base.laser_element(params.f64("length")?, 0.0)]);
    base.finish(name, block, 1, false, tau_info(vec![0.0], false))
}

fn generate_laser_mw_on(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let p = base.params;
    let element = base.mw_laser_element(
        params.f64("length")?,
        0.0,
        p.microwave_amplitude,
        p.microwave_frequency,
        0.0,
    );
    base.finish(name, PulseBlock::new(name, vec![element]), 1, false, tau_info(vec![0.0], false))
}

fn generate_idle(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let block = PulseBlock::new(name, vec![base.idle_element(params.f64("length")?, 0.0)]);
    let mut info = tau_info(vec![0.0], false);
    info.number_of_lasers = 0;
    base.finish(name, block, 1, false, info)
}

fn generate_rabi(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let p = base.params;
    let tau_start = params.f64("tau_start")?;
    let tau_step = params.f64("tau_step")?;
    let number_of_taus = params.usize("number_of_taus")?;

    let mut elements = vec![base.mw_element(tau_start, tau_step, p.microwave_amplitude, p.microwave_frequency, 0.0)];
    elements.extend(base.readout_elements());
    let block = PulseBlock::new(name, elements);
    let info = tau_info(linspace_steps(tau_start, tau_step, number_of_taus), false);
    base.finish(name, block, number_of_taus, false, info)
}

fn generate_pulsedodmr(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let p = base.params;
    let freq_start = params.f64("freq_start")?;
    let freq_step = params.f64("freq_step")?;
    let num_of_points = params.usize("num_of_points")?;
    let freqs = linspace_steps(freq_start, freq_step, num_of_points);

    let mut elements = Vec::new();
    for freq in &freqs {
        elements.push(base.mw_element(p.rabi_period / 2.0, 0.0, p.microwave_amplitude, *freq, 0.0));
        elements.extend(base.readout_elements());
    }
    let block = PulseBlock::new(name, elements);
    let info = MeasurementInformation {
        controlled_variable: freqs,
        units: ("Hz".to_string(), String::new()),
        labels: ("Frequency".to_string(), "Signal".to_string()),
        number_of_lasers: num_of_points,
        ..Default::default()
    };
    base.finish(name, block, 1, false, info)
}

/// Shared body of Ramsey and Hahn echo: `first, tau, [refocus, tau,] last, readout`.
fn tau_sequence(
    base: &PredefinedBase,
    name: &str,
    params: &ParamSet,
    refocus: Option<PulseBlockElement>,
) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let tau_start = params.f64("tau_start")?;
    let tau_step = params.f64("tau_step")?;
    let num_of_points = params.usize("num_of_points")?;
    let alternating = params.bool("alternating")?;

    let pihalf = base.pi_element(0.25, 0.0);
    let tau = base.idle_element(tau_start, tau_step);
    let run = |last: PulseBlockElement, elements: &mut Vec<PulseBlockElement>| {
        elements.push(pihalf.clone());
        elements.push(tau.clone());
        if let Some(refocus) = &refocus {
            elements.push(refocus.clone());
            elements.push(tau.clone());
        }
        elements.push(last);
        elements.extend(base.readout_elements());
    };
    let mut elements = Vec::new();
    run(pihalf.clone(), &mut elements);
    if alternating {
        run(base.pi3half_element(), &mut elements);
    }
    let block = PulseBlock::new(name, elements);
    // With a refocusing pulse the free evolution time is 2 tau
    let scale = if refocus.is_some() { 2.0 } else { 1.0 };
    let taus = linspace_steps(tau_start * scale, tau_step * scale, num_of_points);
    base.finish(name, block, num_of_points, true, tau_info(taus, alternating))
}

fn generate_ramsey(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    tau_sequence(base, name, params, None)
}

fn generate_hahnecho(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    let pi = base.pi_element(0.5, 0.0);
    tau_sequence(base, name, params, Some(pi))
}

/// Appends one XY8-N run: `pi/2, tau/2, N x (X Y X Y Y X Y X), tau/2, last, readout`.
///
/// The eight pi pulses of every XY8 cycle are separated by `tau`, consecutive cycles too.
fn push_xy8(
    base: &PredefinedBase,
    elements: &mut Vec<PulseBlockElement>,
    tauhalf: &PulseBlockElement,
    tau: &PulseBlockElement,
    order: usize,
    last: PulseBlockElement,
) {
    let pix = base.pi_element(0.5, 0.0);
    let piy = base.pi_element(0.5, 90.0);
    elements.push(base.pi_element(0.25, 0.0));
    elements.push(tauhalf.clone());
    for n in 0..order {
        for (i, pulse) in [&pix, &piy, &pix, &piy, &piy, &pix, &piy, &pix].into_iter().enumerate() {
            elements.push(pulse.clone());
            if i < 7 || n + 1 < order {
                elements.push(tau.clone());
            }
        }
    }
    elements.push(tauhalf.clone());
    elements.push(last);
    elements.extend(base.readout_elements());
}

fn xy8_block(
    base: &PredefinedBase,
    elements: &mut Vec<PulseBlockElement>,
    tau: (f64, f64),
    order: usize,
    alternating: bool,
) {
    let tauhalf = base.idle_element(tau.0 / 2.0, tau.1 / 2.0);
    let tau = base.idle_element(tau.0, tau.1);
    push_xy8(base, elements, &tauhalf, &tau, order, base.pi_element(0.25, 0.0));
    if alternating {
        push_xy8(base, elements, &tauhalf, &tau, order, base.pi3half_element());
    }
}

fn generate_xy8_tau(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let tau_start = params.f64("tau_start")?;
    let tau_step = params.f64("tau_step")?;
    let num_of_points = params.usize("num_of_points")?;
    let order = params.usize("xy8_order")?;
    let alternating = params.bool("alternating")?;

    // tau is measured between pulse centres, the idle time between pi pulses is shorter
    let real_start_tau = (tau_start - base.params.rabi_period / 2.0).max(0.0);
    let mut elements = Vec::new();
    xy8_block(base, &mut elements, (real_start_tau, tau_step), order, alternating);
    let block = PulseBlock::new(name, elements);
    let info = tau_info(linspace_steps(tau_start, tau_step, num_of_points), alternating);
    base.finish(name, block, num_of_points, true, info)
}

fn generate_xy8_freq(base: &PredefinedBase, name: &str, params: &ParamSet) -> Result<GeneratedObjects> {
    base.check_channels()?;
    let freq_start = params.f64("freq_start")?;
    let freq_step = params.f64("freq_step")?;
    let num_of_points = params.usize("num_of_points")?;
    let order = params.usize("xy8_order")?;
    let alternating = params.bool("alternating")?;

    let half_pi = base.params.rabi_period / 2.0;
    let mut freqs = Vec::with_capacity(num_of_points);
    let mut elements = Vec::new();
    for freq in linspace_steps(freq_start, freq_step, num_of_points) {
        if freq <= 0.0 {
            return Err(PulsedError::config(format!("XY8 frequency must be positive, got {} Hz", freq)));
        }
        let real_tau = (1.0 / (2.0 * freq) - half_pi).max(0.0);
        // Clipped taus play a different frequency than requested
        freqs.push(1.0 / (2.0 * (real_tau + half_pi)));
        xy8_block(base, &mut elements, (real_tau, 0.0), order, alternating);
    }
    let block = PulseBlock::new(name, elements);
    let info = MeasurementInformation {
        units: ("Hz".to_string(), String::new()),
        labels: ("Frequency".to_string(), "Signal".to_string()),
        ..tau_info(freqs, alternating)
    };
    base.finish(name, block, 1, true, info)
}

fn tau_schema(start: f64, step: f64) -> Vec<ParamSpec> {
    vec![
        ParamSpec::float("tau_start", "s", start, 0.0, f64::INFINITY),
        ParamSpec::float("tau_step", "s", step, 0.0, f64::INFINITY),
        ParamSpec::int("num_of_points", "", 50, 1, 100_000),
        ParamSpec::boolean("alternating", true),
    ]
}

fn xy8_schema(start: ParamSpec, step: ParamSpec) -> Vec<ParamSpec> {
    vec![
        start,
        step,
        ParamSpec::int("num_of_points", "", 50, 1, 100_000),
        ParamSpec::int("xy8_order", "", 4, 1, 1000),
        ParamSpec::boolean("alternating", true),
    ]
}

fn basic_generators() -> Result<Vec<PredefinedGenerator>> {
    let length = || vec![ParamSpec::float("length", "s", 3e-6, 0.0, f64::INFINITY)];
    Ok(vec![
        PredefinedGenerator {
            name: "laser_on".to_string(),
            schema: length(),
            generate: generate_laser_on,
        },
        PredefinedGenerator {
            name: "laser_mw_on".to_string(),
            schema: length(),
            generate: generate_laser_mw_on,
        },
        PredefinedGenerator {
            name: "idle".to_string(),
            schema: length(),
            generate: generate_idle,
        },
        PredefinedGenerator {
            name: "rabi".to_string(),
            schema: vec![
                ParamSpec::float("tau_start", "s", 10e-9, 0.0, f64::INFINITY),
                ParamSpec::float("tau_step", "s", 10e-9, 0.0, f64::INFINITY),
                ParamSpec::int("number_of_taus", "", 50, 1, 100_000),
            ],
            generate: generate_rabi,
        },
        PredefinedGenerator {
            name: "pulsedodmr".to_string(),
            schema: vec![
                ParamSpec::float("freq_start", "Hz", 2870e6, 0.0, f64::INFINITY),
                ParamSpec::float("freq_step", "Hz", 0.2e6, f64::NEG_INFINITY, f64::INFINITY),
                ParamSpec::int("num_of_points", "", 50, 1, 100_000),
            ],
            generate: generate_pulsedodmr,
        },
        PredefinedGenerator {
            name: "ramsey".to_string(),
            schema: tau_schema(1e-6, 1e-6),
            generate: generate_ramsey,
        },
        PredefinedGenerator {
            name: "hahnecho".to_string(),
            schema: tau_schema(1e-6, 1e-6),
            generate: generate_hahnecho,
        },
        PredefinedGenerator {
            name: "xy8_tau".to_string(),
            schema: xy8_schema(
                ParamSpec::float("tau_start", "s", 0.5e-6, 0.0, f64::INFINITY),
                ParamSpec::float("tau_step", "s", 0.01e-6, 0.0, f64::INFINITY),
            ),
            generate: generate_xy8_tau,
        },
        PredefinedGenerator {
            name: "xy8_freq".to_string(),
            schema: xy8_schema(
                ParamSpec::float("freq_start", "Hz", 0.1e6, 0.0, f64::INFINITY),
                ParamSpec::float("freq_step", "Hz", 0.01e6, f64::NEG_INFINITY, f64::INFINITY),
            ),
            generate: generate_xy8_freq,
        },
    ])
}

pub fn predefined_catalog() -> Vec<PluginRoot<PredefinedGenerator>> {
    vec![PluginRoot {
        name: BUILTIN_ROOT,
        modules: vec![PluginModule {
            name: "basic_predefined_methods",
            load: basic_generators,
        }],
    }]
}

pub fn predefined_registry(extra_roots: &[String]) -> Registry<PredefinedGenerator> {
    Registry::from_catalog("predefined generators", &predefined_catalog(), extra_roots)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::resolve_params;
    use crate::sampler::ensemble_info;
    use maplit::btreeset;

    fn settings() -> PulseGeneratorSettings {
        PulseGeneratorSettings {
            sample_rate: 1e9,
            activation_config: (
                "analog1_digital4".to_string(),
                btreeset! {
                    "a_ch1".to_string(),
                    "d_ch1".to_string(),
                    "d_ch2".to_string(),
                    "d_ch3".to_string(),
                    "d_ch4".to_string(),
                },
            ),
            analog_amplitudes: indexmap::indexmap! {"a_ch1".to_string() => 1.0},
        }
    }

    fn run(method: &str, given: ParamSet, params: &GenerationParameters) -> Result<GeneratedObjects> {
        let settings = settings();
        let registry = predefined_registry(&[]);
        let generator = registry.get(method)?;
        let resolved = resolve_params(method, &generator.schema, &given)?;
        let base = PredefinedBase::new(&settings, params);
        (generator.generate)(&base, method, &resolved)
    }

    fn as_map(blocks: &[PulseBlock]) -> IndexMap<String, PulseBlock> {
        blocks.iter().map(|b| (b.name.clone(), b.clone())).collect()
    }

    #[test]
    fn rabi_lasers_match_metadata() {
        let params = GenerationParameters::default();
        let given = ParamSet::new().with("number_of_taus", 20i64);
        let objects = run("rabi", given, &params).unwrap();
        assert_eq!(objects.blocks.len(), 1);
        let ensemble = &objects.ensembles[0];
        let info = ensemble.measurement_information.as_ref().unwrap();
        assert_eq!(info.number_of_lasers, 20);
        assert_eq!(info.controlled_variable.len(), 20);
        assert!(!info.alternating);

        let summary = ensemble_info(ensemble, &as_map(&objects.blocks), 1e9, "d_ch1", None).unwrap();
        assert_eq!(summary.number_of_lasers, 20);
        assert!((summary.length_s - info.counting_length).abs() < 1e-9);
    }

    #[test]
    fn sync_block_is_appended() {
        let params = GenerationParameters {
            sync_channel: Some("d_ch3".to_string()),
            gate_channel: Some("d_ch2".to_string()),
            ..Default::default()
        };
        let objects = run("ramsey", ParamSet::new().with("num_of_points", 5i64), &params).unwrap();
        assert_eq!(objects.blocks.len(), 2);
        let ensemble = &objects.ensembles[0];
        assert_eq!(ensemble.block_list[1], ("sync_trigger".to_string(), 1));
        assert!(ensemble.rotating_frame);
        let info = ensemble.measurement_information.as_ref().unwrap();
        assert_eq!(info.number_of_lasers, 10);
        assert!((info.counting_length - 3.5e-6).abs() < 1e-15);

        let summary =
            ensemble_info(ensemble, &as_map(&objects.blocks), 1e9, "d_ch1", Some("d_ch2")).unwrap();
        assert_eq!(summary.number_of_lasers, 10);
    }

    #[test]
    fn hahnecho_doubles_tau_axis() {
        let params = GenerationParameters::default();
        let given = ParamSet::new()
            .with("tau_start", 1e-6)
            .with("tau_step", 0.5e-6)
            .with("num_of_points", 3i64)
            .with("alternating", false);
        let objects = run("hahnecho", given, &params).unwrap();
        let info = objects.ensembles[0].measurement_information.clone().unwrap();
        let expected = [2e-6, 3e-6, 4e-6];
        assert_eq!(info.controlled_variable.len(), 3);
        for (tau, want) in info.controlled_variable.iter().zip(expected) {
            assert!((tau - want).abs() < 1e-15);
        }
        // pi/2, tau, pi, tau, pi/2, laser, delay, wait
        assert_eq!(objects.blocks[0].element_list.len(), 8);
    }

    #[test]
    fn analog_mw_uses_sine_and_digital_mw_goes_high() {
        let params = GenerationParameters::default();
        let objects = run("laser_mw_on", ParamSet::new(), &params).unwrap();
        let element = &objects.blocks[0].element_list[0];
        assert_eq!(element.pulse_function["a_ch1"].kind, "Sin");
        assert!(element.digital_high["d_ch1"]);

        let params = GenerationParameters {
            microwave_channel: "d_ch4".to_string(),
            ..Default::default()
        };
        let objects = run("laser_mw_on", ParamSet::new(), &params).unwrap();
        let element = &objects.blocks[0].element_list[0];
        assert!(element.pulse_function["a_ch1"].is_idle());
        assert!(element.digital_high["d_ch4"]);
    }

    #[test]
    fn inactive_channel_is_rejected() {
        let params = GenerationParameters {
            laser_channel: "d_ch8".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            run("laser_on", ParamSet::new(), &params),
            Err(PulsedError::Configuration(_))
        ));
        assert!(matches!(
            run("no_such_method", ParamSet::new(), &GenerationParameters::default()),
            Err(PulsedError::Lookup { .. })
        ));
    }

    #[test]
    fn xy8_tau_block_and_axis() {
        let given = ParamSet::new()
            .with("tau_start", 0.5e-6)
            .with("tau_step", 0.1e-6)
            .with("num_of_points", 4i64)
            .with("xy8_order", 2i64);
        let params = GenerationParameters::default();
        let objects = run("xy8_tau", given, &params).unwrap();
        let ensemble = &objects.ensembles[0];
        assert!(ensemble.rotating_frame);
        assert_eq!(ensemble.block_list[0], ("xy8_tau".to_string(), 4));
        // 16 * order + 6 elements per run, two runs when alternating
        let elements = &objects.blocks[0].element_list;
        assert_eq!(elements.len(), 2 * (16 * 2 + 6));
        // The idle time between pi pulses starts at tau minus one pi pulse
        assert!((elements[3].init_length_s - 0.4e-6).abs() < 1e-15);
        assert!((elements[3].increment_s - 0.1e-6).abs() < 1e-15);
        // Y pulses are phase shifted by 90 degrees
        assert_eq!(elements[4].pulse_function["a_ch1"].params.f64("phase").unwrap(), 90.0);

        let info = ensemble.measurement_information.clone().unwrap();
        assert!(info.alternating);
        assert_eq!(info.number_of_lasers, 8);
        let expected = [0.5e-6, 0.6e-6, 0.7e-6, 0.8e-6];
        for (tau, want) in info.controlled_variable.iter().zip(expected) {
            assert!((tau - want).abs() < 1e-15);
        }
        let summary = ensemble_info(ensemble, &as_map(&objects.blocks), 1e9, "d_ch1", None).unwrap();
        assert_eq!(summary.number_of_lasers, 8);
    }

    #[test]
    fn xy8_freq_clips_short_taus() {
        let given = ParamSet::new()
            .with("freq_start", 1e6)
            .with("freq_step", 1e6)
            .with("num_of_points", 3i64)
            .with("xy8_order", 1i64)
            .with("alternating", false);
        // A pi pulse of 1 us leaves no idle time for 1 MHz and above
        let params = GenerationParameters {
            rabi_period: 2e-6,
            ..Default::default()
        };
        let objects = run("xy8_freq", given, &params).unwrap();
        let info = objects.ensembles[0].measurement_information.clone().unwrap();
        assert_eq!(info.number_of_lasers, 3);
        assert_eq!(info.units.0, "Hz");
        assert!(info.controlled_variable.iter().all(|&f| (f - 0.5e6).abs() < 1e-6));
        assert_eq!(objects.blocks[0].element_list.len(), 3 * (16 + 6));

        let given = ParamSet::new()
            .with("freq_start", 0.1e6)
            .with("num_of_points", 5i64)
            .with("alternating", false);
        let objects = run("xy8_freq", given, &GenerationParameters::default()).unwrap();
        let info = objects.ensembles[0].measurement_information.clone().unwrap();
        let expected = [0.1e6, 0.11e6, 0.12e6, 0.13e6, 0.14e6];
        for (freq, want) in info.controlled_variable.iter().zip(expected) {
            assert!((freq - want).abs() < 1e-6);
        }
        let summary = ensemble_info(&objects.ensembles[0], &as_map(&objects.blocks), 1e9, "d_ch1", None).unwrap();
        assert_eq!(summary.number_of_lasers, 5);
    }

    #[test]
    fn pulsedodmr_frequencies() {
        let given = ParamSet::new()
            .with("freq_start", 2.8e9)
            .with("freq_step", 1e6)
            .with("num_of_points", 4i64);
        let objects = run("pulsedodmr", given, &GenerationParameters::default()).unwrap();
        let info = objects.ensembles[0].measurement_information.clone().unwrap();
        assert_eq!(info.number_of_lasers, 4);
        assert_eq!(objects.blocks[0].element_list.len(), 16);
        assert_eq!(info.units.0, "Hz");
    }
}
