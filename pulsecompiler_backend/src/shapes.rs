//! Analog pulse shapes ("sampling functions") and their registry.
//!
//! ## Main structures
//!
//! - [`ShapeDescriptor`]: what an element stores per analog channel, the sampling function name
//!   plus its numeric parameters. Plain data, serializable and comparable.
//! - [`SamplingFunction`]: a registered shape. Evaluation works in place on an array view that
//!   holds sample times on entry and voltages on return, so the compiler never allocates a
//!   second buffer per channel.
//!
//! ## Built-in shapes
//!
//! | name        | parameters                                                          |
//! |-------------|---------------------------------------------------------------------|
//! | `Idle`      | none                                                                |
//! | `DC`        | `voltage`                                                           |
//! | `Sin`       | `amplitude`, `frequency`, `phase` (degrees)                          |
//! | `DoubleSin` | `amplitude_1..2`, `frequency_1..2`, `phase_1..2`                    |
//! | `TripleSin` | `amplitude_1..3`, `frequency_1..3`, `phase_1..3`                    |
//! | `Chirp`     | `amplitude`, `phase`, `start_freq`, `stop_freq`                     |
//!
//! Sine amplitudes are given as peak values and emitted peak-to-peak (`2 * amplitude`), which is
//! what an AWG channel with a peak-to-peak amplitude setting outputs.

use std::f64::consts::PI;
use std::fmt;

use ndarray::ArrayViewMut1;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::{resolve_params, ParamSet, ParamSpec};
use crate::registry::{PluginModule, PluginRoot, Registry, BUILTIN_ROOT};

pub const IDLE: &str = "Idle";

/// Shape stored on an analog channel of an element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    pub kind: String,
    #[serde(default)]
    pub params: ParamSet,
}

impl ShapeDescriptor {
    pub fn new(kind: &str, params: ParamSet) -> Self {
        ShapeDescriptor {
            kind: kind.to_string(),
            params,
        }
    }

    pub fn idle() -> Self {
        Self::new(IDLE, ParamSet::new())
    }

    pub fn dc(voltage: f64) -> Self {
        Self::new("DC", ParamSet::new().with("voltage", voltage))
    }

    /// `phase` in degrees.
    pub fn sin(amplitude: f64, frequency: f64, phase: f64) -> Self {
        Self::new(
            "Sin",
            ParamSet::new()
                .with("amplitude", amplitude)
                .with("frequency", frequency)
                .with("phase", phase),
        )
    }

    pub fn chirp(amplitude: f64, phase: f64, start_freq: f64, stop_freq: f64) -> Self {
        Self::new(
            "Chirp",
            ParamSet::new()
                .with("amplitude", amplitude)
                .with("phase", phase)
                .with("start_freq", start_freq)
                .with("stop_freq", stop_freq),
        )
    }

    pub fn is_idle(&self) -> bool {
        self.kind == IDLE
    }

    /// Replaces the times in `t_arr` with voltages.
    ///
    /// `span` is the element the times belong to, needed by shapes that depend on where in
    /// the element a sample lies (e.g. `Chirp`).
    pub fn eval_inplace(
        &self,
        functions: &Registry<SamplingFunction>,
        span: &ElementSpan,
        t_arr: &mut ArrayViewMut1<f64>,
    ) -> Result<()> {
        let function = functions.get(&self.kind)?;
        let params = resolve_params(&self.kind, &function.schema, &self.params)?;
        (function.eval)(&params, span, t_arr)
    }
}

impl fmt::Display for ShapeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, ")")
    }
}

/// Start time and realized duration of the element being sampled, in the time frame of the
/// samples handed to the shape.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ElementSpan {
    pub start: f64,
    pub duration: f64,
}

pub type ShapeEval = fn(&ParamSet, &ElementSpan, &mut ArrayViewMut1<f64>) -> Result<()>;

pub struct SamplingFunction {
    pub name: String,
    pub schema: Vec<ParamSpec>,
    pub eval: ShapeEval,
}
crate::impl_registry_entry!(SamplingFunction);

fn amplitude_spec(name: &str) -> ParamSpec {
    ParamSpec::float(name, "V", 0.0, 0.0, f64::INFINITY)
}
fn frequency_spec(name: &str) -> ParamSpec {
    ParamSpec::float(name, "Hz", 2.87e9, 0.0, f64::INFINITY)
}
fn phase_spec(name: &str) -> ParamSpec {
    ParamSpec::float(name, "°", 0.0, -360.0, 360.0)
}

fn eval_idle(_: &ParamSet, _: &ElementSpan, t_arr: &mut ArrayViewMut1<f64>) -> Result<()> {
    t_arr.fill(0.0);
    Ok(())
}

fn eval_dc(params: &ParamSet, _: &ElementSpan, t_arr: &mut ArrayViewMut1<f64>) -> Result<()> {
    t_arr.fill(params.f64("voltage")?);
    Ok(())
}

/// Reads `(peak-to-peak amplitude, frequency, phase in rad)` of sine number `suffix`.
fn sine_terms(params: &ParamSet, suffix: &str) -> Result<(f64, f64, f64)> {
    let amp = params.f64(&format!("amplitude{}", suffix))?;
    let freq = params.f64(&format!("frequency{}", suffix))?;
    let phase = params.f64(&format!("phase{}", suffix))?;
    Ok((2.0 * amp, freq, phase.to_radians()))
}

fn eval_sines(params: &ParamSet, suffixes: &[&str], t_arr: &mut ArrayViewMut1<f64>) -> Result<()> {
    let terms = suffixes
        .iter()
        .map(|suffix| sine_terms(params, suffix))
        .collect::<Result<Vec<_>>>()?;
    t_arr.map_inplace(|t| {
        *t = terms
            .iter()
            .map(|(amp, freq, phase)| amp * (2.0 * PI * freq * (*t) + phase).sin())
            .sum()
    });
    Ok(())
}

fn eval_sin(params: &ParamSet, _: &ElementSpan, t_arr: &mut ArrayViewMut1<f64>) -> Result<()> {
    eval_sines(params, &[""], t_arr)
}

fn eval_double_sin(params: &ParamSet, _: &ElementSpan, t_arr: &mut ArrayViewMut1<f64>) -> Result<()> {
    eval_sines(params, &["_1", "_2"], t_arr)
}

fn eval_triple_sin(params: &ParamSet, _: &ElementSpan, t_arr: &mut ArrayViewMut1<f64>) -> Result<()> {
    eval_sines(params, &["_1", "_2", "_3"], t_arr)
}

fn eval_chirp(params: &ParamSet, span: &ElementSpan, t_arr: &mut ArrayViewMut1<f64>) -> Result<()> {
    let amp = 2.0 * params.f64("amplitude")?;
    let phase = params.f64("phase")?.to_radians();
    let start_freq = params.f64("start_freq")?;
    let freq_diff = params.f64("stop_freq")? - start_freq;
    // Single-sample elements have no sweep
    let sweep_rate = if span.duration > 0.0 {
        freq_diff / span.duration / 2.0
    } else {
        0.0
    };
    t_arr.map_inplace(|t| {
        let local = *t - span.start;
        *t = amp * (2.0 * PI * (*t) * (start_freq + sweep_rate * local) + phase).sin()
    });
    Ok(())
}

fn basic_functions() -> Result<Vec<SamplingFunction>> {
    let sine_schema = |suffixes: &[&str]| {
        suffixes
            .iter()
            .flat_map(|s| {
                vec![
                    amplitude_spec(&format!("amplitude{}", s)),
                    frequency_spec(&format!("frequency{}", s)),
                    phase_spec(&format!("phase{}", s)),
                ]
            })
            .collect::<Vec<_>>()
    };
    Ok(vec![
        SamplingFunction {
            name: IDLE.to_string(),
            schema: vec![],
            eval: eval_idle,
        },
        SamplingFunction {
            name: "DC".to_string(),
            schema: vec![ParamSpec::float(
                "voltage",
                "V",
                0.0,
                f64::NEG_INFINITY,
                f64::INFINITY,
            )],
            eval: eval_dc,
        },
        SamplingFunction {
            name: "Sin".to_string(),
            schema: sine_schema(&[""]),
            eval: eval_sin,
        },
        SamplingFunction {
            name: "DoubleSin".to_string(),
            schema: sine_schema(&["_1", "_2"]),
            eval: eval_double_sin,
        },
        SamplingFunction {
            name: "TripleSin".to_string(),
            schema: sine_schema(&["_1", "_2", "_3"]),
            eval: eval_triple_sin,
        },
        SamplingFunction {
            name: "Chirp".to_string(),
            schema: vec![
                amplitude_spec("amplitude"),
                phase_spec("phase"),
                frequency_spec("start_freq"),
                frequency_spec("stop_freq"),
            ],
            eval: eval_chirp,
        },
    ])
}

/// Every plugin root providing sampling functions.
pub fn sampling_function_catalog() -> Vec<PluginRoot<SamplingFunction>> {
    vec![PluginRoot {
        name: BUILTIN_ROOT,
        modules: vec![PluginModule {
            name: "basic_sampling_functions",
            load: basic_functions,
        }],
    }]
}

pub fn sampling_function_registry(extra_roots: &[String]) -> Registry<SamplingFunction> {
    Registry::from_catalog("sampling functions", &sampling_function_catalog(), extra_roots)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array1;

    fn eval(shape: &ShapeDescriptor, t: &Array1<f64>) -> Array1<f64> {
        let registry = sampling_function_registry(&[]);
        let mut out = t.clone();
        let span = ElementSpan {
            start: t[0],
            duration: t[t.len() - 1] - t[0],
        };
        shape.eval_inplace(&registry, &span, &mut out.view_mut()).unwrap();
        out
    }

    #[test]
    fn builtin_names() {
        let registry = sampling_function_registry(&[]);
        assert_eq!(
            registry.names(),
            vec!["Idle", "DC", "Sin", "DoubleSin", "TripleSin", "Chirp"]
        );
        assert_eq!(registry.schemas()["Sin"][2].unit, "°");
    }

    #[test]
    fn idle_and_dc() {
        let t = Array1::linspace(0.0, 1e-6, 11);
        assert!(eval(&ShapeDescriptor::idle(), &t).iter().all(|&v| v == 0.0));
        assert!(eval(&ShapeDescriptor::dc(0.3), &t).iter().all(|&v| v == 0.3));
    }

    #[test]
    fn sin_is_peak_to_peak() {
        // Quarter period at 1 MHz
        let t = Array1::from(vec![0.0, 0.25e-6]);
        let out = eval(&ShapeDescriptor::sin(0.25, 1e6, 0.0), &t);
        assert!(out[0].abs() < 1e-12);
        assert!((out[1] - 0.5).abs() < 1e-12);

        let out = eval(&ShapeDescriptor::sin(0.25, 1e6, 90.0), &t);
        assert!((out[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn double_sin_is_superposition() {
        let t = Array1::linspace(0.0, 1e-6, 7);
        let params = ParamSet::new()
            .with("amplitude_1", 0.1)
            .with("frequency_1", 1e6)
            .with("amplitude_2", 0.2)
            .with("frequency_2", 3e6);
        let double = eval(&ShapeDescriptor::new("DoubleSin", params), &t);
        let first = eval(&ShapeDescriptor::sin(0.1, 1e6, 0.0), &t);
        let second = eval(&ShapeDescriptor::sin(0.2, 3e6, 0.0), &t);
        for i in 0..t.len() {
            assert!((double[i] - first[i] - second[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn chirp_without_sweep_is_sine() {
        let t = Array1::linspace(0.0, 1e-6, 9);
        let chirp = eval(&ShapeDescriptor::chirp(0.1, 0.0, 2e6, 2e6), &t);
        let sine = eval(&ShapeDescriptor::sin(0.1, 2e6, 0.0), &t);
        for i in 0..t.len() {
            assert!((chirp[i] - sine[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn unknown_shape_and_bad_params() {
        let registry = sampling_function_registry(&[]);
        let span = ElementSpan { start: 0.0, duration: 1.0 };
        let mut t = Array1::zeros(3);
        let unknown = ShapeDescriptor::new("Square", ParamSet::new());
        assert!(unknown.eval_inplace(&registry, &span, &mut t.view_mut()).is_err());
        let negative = ShapeDescriptor::sin(-1.0, 1e6, 0.0);
        assert!(negative.eval_inplace(&registry, &span, &mut t.view_mut()).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(ShapeDescriptor::dc(0.5).to_string(), "DC(voltage=0.5)");
    }
}
