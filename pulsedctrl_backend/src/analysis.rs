//! Pulse analysis: one signal value and its error per extracted laser pulse.
//!
//! Time windows are given in seconds relative to the start of each laser window and converted
//! with the counter bin width. Windows reaching past the laser window are cut at its end.
//!
//! | name             | signal                                       |
//! |------------------|----------------------------------------------|
//! | `mean_norm`      | mean of signal window / mean of norm window |
//! | `sum`            | counts in the signal window                  |
//! | `mean`           | mean counts per bin in the signal window     |
//! | `mean_reference` | signal window mean minus norm window mean    |
//! | `pass_through`   | mean counts per bin over the whole window    |
//!
//! Errors assume Poissonian counting statistics.

use ndarray::{s, Array1, ArrayView2, Axis};

use pulsecompiler_backend::error::{PulsedError, Result};
use pulsecompiler_backend::params::{resolve_params, ParamSet, ParamSpec};
use pulsecompiler_backend::registry::{PluginModule, PluginRoot, Registry, BUILTIN_ROOT};

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisContext {
    /// Counter bin width, seconds.
    pub bin_width: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisResult {
    pub signal: Array1<f64>,
    pub error: Array1<f64>,
}

impl AnalysisResult {
    pub fn zeros(number_of_lasers: usize) -> Self {
        AnalysisResult {
            signal: Array1::zeros(number_of_lasers),
            error: Array1::zeros(number_of_lasers),
        }
    }
}

pub type AnalyseFn = fn(&ArrayView2<u64>, &AnalysisContext, &ParamSet) -> Result<AnalysisResult>;

pub struct AnalysisMethod {
    pub name: String,
    pub schema: Vec<ParamSpec>,
    pub run: AnalyseFn,
}

pulsecompiler_backend::impl_registry_entry!(AnalysisMethod);

impl AnalysisMethod {
    pub fn analyse(
        &self,
        laser_counts: &ArrayView2<u64>,
        context: &AnalysisContext,
        params: &ParamSet,
    ) -> Result<AnalysisResult> {
        if !(context.bin_width > 0.0) {
            return Err(PulsedError::config("Counter bin width must be positive"));
        }
        let params = resolve_params(&self.name, &self.schema, params)?;
        (self.run)(laser_counts, context, &params)
    }
}

/// `[start, end)` bins of the `<prefix>_start`/`<prefix>_end` window.
fn window(
    prefix: &str,
    laser_counts: &ArrayView2<u64>,
    context: &AnalysisContext,
    params: &ParamSet,
) -> Result<(usize, usize)> {
    let to_bin = |key: String| -> Result<usize> {
        Ok((params.f64(&key)? / context.bin_width).round().max(0.0) as usize)
    };
    let start = to_bin(format!("{}_start", prefix))?;
    let end = to_bin(format!("{}_end", prefix))?.min(laser_counts.ncols());
    if end <= start {
        return Err(PulsedError::config(format!(
            "The {} window [{}, {}) bins is empty for laser windows of {} bins",
            prefix,
            start,
            end,
            laser_counts.ncols()
        )));
    }
    Ok((start, end))
}

fn window_sums(laser_counts: &ArrayView2<u64>, (start, end): (usize, usize)) -> Array1<f64> {
    laser_counts
        .slice(s![.., start..end])
        .map(|&c| c as f64)
        .sum_axis(Axis(1))
}

fn mean_norm(laser_counts: &ArrayView2<u64>, context: &AnalysisContext, params: &ParamSet) -> Result<AnalysisResult> {
    let signal_window = window("signal", laser_counts, context, params)?;
    let norm_window = window("norm", laser_counts, context, params)?;
    let signal_sums = window_sums(laser_counts, signal_window);
    let norm_sums = window_sums(laser_counts, norm_window);
    let signal_bins = (signal_window.1 - signal_window.0) as f64;
    let norm_bins = (norm_window.1 - norm_window.0) as f64;

    let mut signal = Array1::zeros(signal_sums.len());
    let mut error = Array1::zeros(signal_sums.len());
    for (i, (&sig, &norm)) in signal_sums.iter().zip(norm_sums.iter()).enumerate() {
        if norm > 0.0 {
            signal[i] = (sig / signal_bins) / (norm / norm_bins);
        }
        if sig > 0.0 && norm > 0.0 {
            error[i] = signal[i] * (1.0 / sig + 1.0 / norm).sqrt();
        }
    }
    Ok(AnalysisResult { signal, error })
}

fn sum(laser_counts: &ArrayView2<u64>, context: &AnalysisContext, params: &ParamSet) -> Result<AnalysisResult> {
    let signal = window_sums(laser_counts, window("signal", laser_counts, context, params)?);
    let error = signal.mapv(f64::sqrt);
    Ok(AnalysisResult { signal, error })
}

fn mean(laser_counts: &ArrayView2<u64>, context: &AnalysisContext, params: &ParamSet) -> Result<AnalysisResult> {
    let signal_window = window("signal", laser_counts, context, params)?;
    let bins = (signal_window.1 - signal_window.0) as f64;
    let sums = window_sums(laser_counts, signal_window);
    Ok(AnalysisResult {
        signal: &sums / bins,
        error: sums.mapv(f64::sqrt) / bins,
    })
}

fn mean_reference(
    laser_counts: &ArrayView2<u64>,
    context: &AnalysisContext,
    params: &ParamSet,
) -> Result<AnalysisResult> {
    let signal_window = window("signal", laser_counts, context, params)?;
    let norm_window = window("norm", laser_counts, context, params)?;
    let signal_bins = (signal_window.1 - signal_window.0) as f64;
    let norm_bins = (norm_window.1 - norm_window.0) as f64;
    let signal_sums = window_sums(laser_counts, signal_window);
    let norm_sums = window_sums(laser_counts, norm_window);
    Ok(AnalysisResult {
        signal: &signal_sums / signal_bins - &norm_sums / norm_bins,
        error: (&signal_sums / (signal_bins * signal_bins) + &norm_sums / (norm_bins * norm_bins))
            .mapv(f64::sqrt),
    })
}

fn pass_through(laser_counts: &ArrayView2<u64>, _context: &AnalysisContext, _params: &ParamSet) -> Result<AnalysisResult> {
    let n = laser_counts.nrows();
    if laser_counts.ncols() == 0 {
        return Ok(AnalysisResult::zeros(n));
    }
    let signal = laser_counts
        .map(|&c| c as f64)
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(n));
    Ok(AnalysisResult {
        signal,
        error: Array1::zeros(n),
    })
}

fn two_window_schema() -> Vec<ParamSpec> {
    vec![
        ParamSpec::float("signal_start", "s", 0.0, 0.0, 1.0),
        ParamSpec::float("signal_end", "s", 200e-9, 0.0, 1.0),
        ParamSpec::float("norm_start", "s", 300e-9, 0.0, 1.0),
        ParamSpec::float("norm_end", "s", 500e-9, 0.0, 1.0),
    ]
}

fn signal_window_schema() -> Vec<ParamSpec> {
    two_window_schema().into_iter().take(2).collect()
}

fn basic_methods() -> Result<Vec<AnalysisMethod>> {
    Ok(vec![
        AnalysisMethod {
            name: "mean_norm".to_string(),
            schema: two_window_schema(),
            run: mean_norm,
        },
        AnalysisMethod {
            name: "sum".to_string(),
            schema: signal_window_schema(),
            run: sum,
        },
        AnalysisMethod {
            name: "mean".to_string(),
            schema: signal_window_schema(),
            run: mean,
        },
        AnalysisMethod {
            name: "mean_reference".to_string(),
            schema: two_window_schema(),
            run: mean_reference,
        },
        AnalysisMethod {
            name: "pass_through".to_string(),
            schema: Vec::new(),
            run: pass_through,
        },
    ])
}

pub fn analysis_catalog() -> Vec<PluginRoot<AnalysisMethod>> {
    vec![PluginRoot {
        name: BUILTIN_ROOT,
        modules: vec![PluginModule {
            name: "basic_analysis_methods",
            load: basic_methods,
        }],
    }]
}

pub fn analysis_registry(extra_roots: &[String]) -> Registry<AnalysisMethod> {
    Registry::from_catalog("analysis methods", &analysis_catalog(), extra_roots)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array2;
    use pulsecompiler_backend::registry::MethodSelection;

    /// Laser 0 is flat at 2 counts, laser 1 doubles during the first 200 bins.
    fn lasers() -> Array2<u64> {
        Array2::from_shape_fn((2, 600), |(laser, bin)| if laser == 1 && bin < 200 { 4 } else { 2 })
    }

    fn run(name: &str, counts: &Array2<u64>, params: &ParamSet) -> Result<AnalysisResult> {
        analysis_registry(&[])
            .get(name)
            .unwrap()
            .analyse(&counts.view(), &AnalysisContext { bin_width: 1e-9 }, params)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn normalised_mean() {
        let result = run("mean_norm", &lasers(), &ParamSet::new()).unwrap();
        assert!(close(result.signal[0], 1.0));
        assert!(close(result.signal[1], 2.0));
        assert!(close(result.error[0], (2.0f64 / 400.0).sqrt()));
        assert!(close(result.error[1], 2.0 * (1.0f64 / 800.0 + 1.0 / 400.0).sqrt()));
    }

    #[test]
    fn zero_reference_gives_zero_signal() {
        let counts = Array2::from_shape_fn((1, 600), |(_, bin)| if bin < 200 { 3 } else { 0 });
        let result = run("mean_norm", &counts, &ParamSet::new()).unwrap();
        assert_eq!(result.signal[0], 0.0);
        assert_eq!(result.error[0], 0.0);
    }

    #[test]
    fn sums_and_means() {
        let counts = lasers();
        let sums = run("sum", &counts, &ParamSet::new()).unwrap();
        assert_eq!(sums.signal.to_vec(), vec![400.0, 800.0]);
        assert!(close(sums.error[1], 800f64.sqrt()));

        let means = run("mean", &counts, &ParamSet::new()).unwrap();
        assert_eq!(means.signal.to_vec(), vec![2.0, 4.0]);

        let difference = run("mean_reference", &counts, &ParamSet::new()).unwrap();
        assert!(close(difference.signal[0], 0.0));
        assert!(close(difference.signal[1], 2.0));

        let all = run("pass_through", &counts, &ParamSet::new()).unwrap();
        assert!(close(all.signal[1], (200.0 * 4.0 + 400.0 * 2.0) / 600.0));
    }

    #[test]
    fn windows_are_cut_at_the_laser_end() {
        let counts = lasers();
        let params = ParamSet::new().with("signal_start", 500e-9).with("signal_end", 1e-6);
        let result = run("sum", &counts, &params).unwrap();
        assert_eq!(result.signal.to_vec(), vec![200.0, 200.0]);

        let empty = ParamSet::new().with("signal_start", 700e-9).with("signal_end", 1e-6);
        assert!(matches!(
            run("sum", &counts, &empty),
            Err(PulsedError::Configuration(_))
        ));
    }

    #[test]
    fn parameters_only_reach_the_selected_method() {
        let mut selection = MethodSelection::new(analysis_registry(&[]), "mean_norm").unwrap();
        selection
            .set_parameters(&ParamSet::new().with("signal_end", 300e-9))
            .unwrap();
        assert_eq!(
            selection.parameters_of("sum").unwrap().f64("signal_end").unwrap(),
            200e-9
        );
        selection
            .set_parameters(&ParamSet::new().with("method", "sum").with("signal_start", 10e-9))
            .unwrap();
        assert_eq!(selection.current_method(), "sum");
        assert_eq!(
            selection.parameters_of("mean_norm").unwrap().f64("signal_end").unwrap(),
            300e-9
        );
    }
}
