//! Laser pulse extraction: raw counter data in, one row of counts per laser pulse out.
//!
//! ## Built-in methods
//!
//! - `ungated_threshold`: finds laser pulses in a continuous trace by hysteresis threshold
//!   crossing. A pulse starts at the first bin at or above `high_threshold` and ends after the
//!   last bin before the trace falls below `low_threshold`. Both thresholds are fractions of the
//!   trace maximum, so they keep working while counts accumulate over sweeps. Dips shorter than
//!   `gap_tolerance` are bridged and pulses shorter than `min_laser_length` are dropped.
//! - `ungated_known_edges`: cuts windows at the laser rising edges the compiler recorded for the
//!   loaded asset.
//! - `gated_conv_deriv`: sums all gates, smooths the sum with a Gaussian kernel and takes the
//!   common rising and falling edge from the extrema of its derivative.
//!
//! Windows of the ungated methods start at the detected edge plus `delay` and are
//! `window_length` long. Bins outside the trace read as zero.

use ndarray::{Array2, ArrayView1, Axis};

use pulsecompiler_backend::error::{PulsedError, Result};
use pulsecompiler_backend::params::{resolve_params, ParamSet, ParamSpec};
use pulsecompiler_backend::pulse_objects::SamplingInformation;
use pulsecompiler_backend::registry::{PluginModule, PluginRoot, Registry, BUILTIN_ROOT};

use crate::hardware::CountData;

/// What an extraction method knows beyond the raw counts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractionContext {
    /// Counter bin width, seconds.
    pub bin_width: f64,
    pub number_of_lasers: usize,
    /// Laser rising edges of the loaded asset, seconds from the start of playback.
    pub laser_rising_times: Vec<f64>,
}

impl ExtractionContext {
    /// Takes the rising edges of `edge_channel` from the sampling record, if there is one.
    pub fn new(
        bin_width: f64,
        number_of_lasers: usize,
        sampling_information: Option<&SamplingInformation>,
        edge_channel: &str,
    ) -> Self {
        let laser_rising_times = sampling_information
            .filter(|info| info.sample_rate() > 0.0)
            .and_then(|info| {
                let rate = info.sample_rate();
                info.digital_rising_bins
                    .get(edge_channel)
                    .map(|bins| bins.iter().map(|&bin| bin as f64 / rate).collect())
            })
            .unwrap_or_default();
        ExtractionContext {
            bin_width,
            number_of_lasers,
            laser_rising_times,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExtractionResult {
    /// Laser index x time bin.
    pub laser_counts: Array2<u64>,
    pub laser_indices_rising: Vec<usize>,
    pub laser_indices_falling: Vec<usize>,
}

pub type ExtractFn = fn(&CountData, &ExtractionContext, &ParamSet) -> Result<ExtractionResult>;

pub struct ExtractionMethod {
    pub name: String,
    pub schema: Vec<ParamSpec>,
    /// Whether the method expects gated counter data.
    pub gated: bool,
    pub run: ExtractFn,
}

pulsecompiler_backend::impl_registry_entry!(ExtractionMethod);

impl ExtractionMethod {
    pub fn extract(
        &self,
        data: &CountData,
        context: &ExtractionContext,
        params: &ParamSet,
    ) -> Result<ExtractionResult> {
        if data.is_gated() != self.gated {
            return Err(PulsedError::config(format!(
                "Extraction method {} expects {} counter data",
                self.name,
                if self.gated { "gated" } else { "ungated" }
            )));
        }
        if !(context.bin_width > 0.0) {
            return Err(PulsedError::config("Counter bin width must be positive"));
        }
        let params = resolve_params(&self.name, &self.schema, params)?;
        (self.run)(data, context, &params)
    }
}

fn to_bins(seconds: f64, bin_width: f64) -> i64 {
    (seconds / bin_width).round() as i64
}

fn ungated(data: &CountData) -> Result<ArrayView1<u64>> {
    match data {
        CountData::Ungated(trace) => Ok(trace.view()),
        CountData::Gated(_) => Err(PulsedError::config("Expected an ungated trace")),
    }
}

/// Cuts `length` bins from every start, reading zero outside the trace.
fn slice_windows(trace: &ArrayView1<u64>, starts: &[i64], length: usize) -> Array2<u64> {
    let n = trace.len() as i64;
    Array2::from_shape_fn((starts.len(), length), |(laser, bin)| {
        let idx = starts[laser] + bin as i64;
        if (0..n).contains(&idx) {
            trace[idx as usize]
        } else {
            0
        }
    })
}

/// Runs as `[start, end)` bin ranges.
fn hysteresis_runs(trace: &ArrayView1<u64>, high: f64, low: f64, gap_bins: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    // (start, last bin at or above low)
    let mut current: Option<(usize, usize)> = None;
    for (bin, &count) in trace.iter().enumerate() {
        let count = count as f64;
        current = match current {
            None if count >= high => Some((bin, bin)),
            None => None,
            Some((start, _)) if count >= low => Some((start, bin)),
            Some((start, last)) if bin - last > gap_bins => {
                runs.push((start, last + 1));
                None
            }
            keep => keep,
        };
    }
    if let Some((start, last)) = current {
        runs.push((start, last + 1));
    }
    runs
}

fn window_params(context: &ExtractionContext, params: &ParamSet) -> Result<(i64, usize)> {
    let delay = to_bins(params.f64("delay")?, context.bin_width);
    let window = to_bins(params.f64("window_length")?, context.bin_width).max(0) as usize;
    Ok((delay, window))
}

fn ungated_threshold(
    data: &CountData,
    context: &ExtractionContext,
    params: &ParamSet,
) -> Result<ExtractionResult> {
    let trace = ungated(data)?;
    let high = params.f64("high_threshold")?;
    let low = params.f64("low_threshold")?;
    if low > high {
        return Err(PulsedError::config(format!(
            "Low threshold {} is above the high threshold {}",
            low, high
        )));
    }
    let max = trace.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return Err(PulsedError::Processing("trace holds no counts".to_string()));
    }
    let gap_bins = to_bins(params.f64("gap_tolerance")?, context.bin_width).max(0) as usize;
    let min_bins = to_bins(params.f64("min_laser_length")?, context.bin_width).max(1) as usize;

    let runs: Vec<(usize, usize)> = hysteresis_runs(&trace, high * max as f64, low * max as f64, gap_bins)
        .into_iter()
        .filter(|(start, end)| end - start >= min_bins)
        .collect();
    if runs.len() != context.number_of_lasers {
        return Err(PulsedError::Processing(format!(
            "found {} laser pulses, expected {}",
            runs.len(),
            context.number_of_lasers
        )));
    }

    let (delay, mut window) = window_params(context, params)?;
    if window == 0 {
        window = runs.iter().map(|(start, end)| end - start).max().unwrap_or(0);
    }
    let starts: Vec<i64> = runs.iter().map(|(start, _)| *start as i64 + delay).collect();
    Ok(ExtractionResult {
        laser_counts: slice_windows(&trace, &starts, window),
        laser_indices_rising: runs.iter().map(|(start, _)| *start).collect(),
        laser_indices_falling: runs.iter().map(|(_, end)| *end).collect(),
    })
}

fn ungated_known_edges(
    data: &CountData,
    context: &ExtractionContext,
    params: &ParamSet,
) -> Result<ExtractionResult> {
    let trace = ungated(data)?;
    if context.laser_rising_times.is_empty() {
        return Err(PulsedError::Processing(
            "no laser edges are known for the loaded asset".to_string(),
        ));
    }
    if context.laser_rising_times.len() != context.number_of_lasers {
        return Err(PulsedError::Processing(format!(
            "the loaded asset has {} laser edges, expected {}",
            context.laser_rising_times.len(),
            context.number_of_lasers
        )));
    }
    let edges: Vec<i64> = context
        .laser_rising_times
        .iter()
        .map(|&t| to_bins(t, context.bin_width))
        .collect();
    let (delay, mut window) = window_params(context, params)?;
    if window == 0 {
        // Up to the next edge, or the end of the trace for a single pulse
        window = edges
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).max(0) as usize)
            .min()
            .unwrap_or_else(|| (trace.len() as i64 - edges[0]).max(0) as usize);
    }
    let starts: Vec<i64> = edges.iter().map(|edge| edge + delay).collect();
    Ok(ExtractionResult {
        laser_counts: slice_windows(&trace, &starts, window),
        laser_indices_rising: starts.iter().map(|&s| s.max(0) as usize).collect(),
        laser_indices_falling: starts.iter().map(|&s| (s + window as i64).max(0) as usize).collect(),
    })
}

/// Index of the mirrored sample for out-of-range positions (`d c b a | a b c d | d c b a`).
fn reflect(idx: i64, len: i64) -> usize {
    let period = 2 * len;
    let idx = idx.rem_euclid(period);
    if idx >= len {
        (period - 1 - idx) as usize
    } else {
        idx as usize
    }
}

/// Gaussian smoothing with the kernel truncated at four standard deviations.
pub fn gaussian_filter(data: &[f64], std_dev: f64) -> Vec<f64> {
    if std_dev <= 0.0 || data.is_empty() {
        return data.to_vec();
    }
    let radius = (4.0 * std_dev + 0.5) as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-((x * x) as f64) / (2.0 * std_dev * std_dev)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= norm);
    let len = data.len() as i64;
    (0..len)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * data[reflect(i + k as i64 - radius, len)])
                .sum()
        })
        .collect()
}

/// Central differences inside, one-sided differences at both ends.
pub fn gradient(data: &[f64]) -> Vec<f64> {
    let n = data.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| match i {
            0 => data[1] - data[0],
            i if i == n - 1 => data[n - 1] - data[n - 2],
            i => (data[i + 1] - data[i - 1]) / 2.0,
        })
        .collect()
}

fn gated_conv_deriv(
    data: &CountData,
    _context: &ExtractionContext,
    params: &ParamSet,
) -> Result<ExtractionResult> {
    let gates = match data {
        CountData::Gated(gates) => gates,
        CountData::Ungated(_) => return Err(PulsedError::config("Expected gated counter data")),
    };
    if gates.ncols() < 2 {
        return Err(PulsedError::Processing("gates are too short to find edges".to_string()));
    }
    let summed: Vec<f64> = gates.sum_axis(Axis(0)).iter().map(|&c| c as f64).collect();
    let smoothed = gaussian_filter(&summed, params.f64("conv_std_dev")?);
    let derivative = gradient(&smoothed);

    let mut rising = 0;
    let mut falling = 0;
    for (i, &d) in derivative.iter().enumerate() {
        if d > derivative[rising] {
            rising = i;
        }
        if d < derivative[falling] {
            falling = i;
        }
    }
    if falling <= rising {
        return Err(PulsedError::Processing(format!(
            "no laser pulse found in the gates (rising edge {}, falling edge {})",
            rising, falling
        )));
    }
    let laser_counts = gates.slice(ndarray::s![.., rising..falling]).to_owned();
    Ok(ExtractionResult {
        laser_counts,
        laser_indices_rising: vec![rising],
        laser_indices_falling: vec![falling],
    })
}

fn window_schema() -> Vec<ParamSpec> {
    vec![
        ParamSpec::float("delay", "s", 0.0, -1e-3, 1e-3),
        ParamSpec::float("window_length", "s", 0.0, 0.0, 1.0),
    ]
}

fn basic_methods() -> Result<Vec<ExtractionMethod>> {
    let mut threshold_schema = vec![
        ParamSpec::float("high_threshold", "", 0.5, 0.0, 1.0),
        ParamSpec::float("low_threshold", "", 0.3, 0.0, 1.0),
        ParamSpec::float("gap_tolerance", "s", 10e-9, 0.0, 1e-3),
        ParamSpec::float("min_laser_length", "s", 10e-9, 0.0, 1e-3),
    ];
    threshold_schema.extend(window_schema());
    Ok(vec![
        ExtractionMethod {
            name: "ungated_threshold".to_string(),
            schema: threshold_schema,
            gated: false,
            run: ungated_threshold,
        },
        ExtractionMethod {
            name: "ungated_known_edges".to_string(),
            schema: window_schema(),
            gated: false,
            run: ungated_known_edges,
        },
        ExtractionMethod {
            name: "gated_conv_deriv".to_string(),
            schema: vec![ParamSpec::float("conv_std_dev", "bins", 20.0, 0.0, 1e5)],
            gated: true,
            run: gated_conv_deriv,
        },
    ])
}

pub fn extraction_catalog() -> Vec<PluginRoot<ExtractionMethod>> {
    vec![PluginRoot {
        name: BUILTIN_ROOT,
        modules: vec![PluginModule {
            name: "basic_extraction_methods",
            load: basic_methods,
        }],
    }]
}

pub fn extraction_registry(extra_roots: &[String]) -> Registry<ExtractionMethod> {
    Registry::from_catalog("extraction methods", &extraction_catalog(), extra_roots)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dummy_hardware::{gated_pulse_trace, laser_pulse_trace};
    use indexmap::indexmap;
    use ndarray::{s, Array1};
    use pulsecompiler_backend::registry::MethodSelection;

    const STARTS: [usize; 5] = [50, 230, 410, 590, 770];

    fn five_pulses() -> Array1<u64> {
        laser_pulse_trace(1000, &STARTS, 100, 40, 2)
    }

    fn context() -> ExtractionContext {
        ExtractionContext {
            bin_width: 1e-9,
            number_of_lasers: 5,
            laser_rising_times: Vec::new(),
        }
    }

    fn run(name: &str, data: &CountData, context: &ExtractionContext, params: &ParamSet) -> Result<ExtractionResult> {
        extraction_registry(&[]).get(name).unwrap().extract(data, context, params)
    }

    #[test]
    fn five_known_windows() {
        let trace = five_pulses();
        let data = CountData::Ungated(trace.clone());
        let result = run("ungated_threshold", &data, &context(), &ParamSet::new()).unwrap();
        assert_eq!(result.laser_counts.shape(), &[5, 100]);
        assert_eq!(result.laser_indices_rising, STARTS.to_vec());
        for (i, &start) in STARTS.iter().enumerate() {
            assert_eq!(result.laser_counts.row(i), trace.slice(s![start..start + 100]));
        }
    }

    #[test]
    fn five_known_windows_with_delay() {
        let trace = five_pulses();
        let data = CountData::Ungated(trace.clone());
        let params = ParamSet::new()
            .with("delay", 20e-9)
            .with("window_length", 120e-9);
        let result = run("ungated_threshold", &data, &context(), &params).unwrap();
        assert_eq!(result.laser_counts.shape(), &[5, 120]);
        for (i, &start) in STARTS.iter().enumerate() {
            assert_eq!(
                result.laser_counts.row(i),
                trace.slice(s![start + 20..start + 140])
            );
        }
    }

    #[test]
    fn windows_past_the_trace_end_read_zero() {
        let data = CountData::Ungated(five_pulses());
        let params = ParamSet::new().with("delay", 200e-9);
        let result = run("ungated_threshold", &data, &context(), &params).unwrap();
        let last = result.laser_counts.row(4);
        assert!(last.slice(s![..30]).iter().all(|&c| c == 2));
        assert!(last.slice(s![30..]).iter().all(|&c| c == 0));
    }

    #[test]
    fn hysteresis_bridges_short_dips() {
        let mut trace = laser_pulse_trace(100, &[10], 20, 40, 0);
        trace[20] = 5;
        let data = CountData::Ungated(trace);
        let one = ExtractionContext {
            number_of_lasers: 1,
            ..context()
        };

        let bridged = run("ungated_threshold", &data, &one, &ParamSet::new().with("gap_tolerance", 2e-9)).unwrap();
        assert_eq!(bridged.laser_indices_rising, vec![10]);
        assert_eq!(bridged.laser_indices_falling, vec![30]);

        // Without bridging the second half is one bin too short and is dropped
        let split = run(
            "ungated_threshold",
            &data,
            &one,
            &ParamSet::new().with("gap_tolerance", 0.0),
        )
        .unwrap();
        assert_eq!(split.laser_indices_falling, vec![20]);
        assert_eq!(split.laser_counts.shape(), &[1, 10]);
    }

    #[test]
    fn pulse_count_mismatch_is_a_processing_error() {
        let data = CountData::Ungated(five_pulses());
        let four = ExtractionContext {
            number_of_lasers: 4,
            ..context()
        };
        assert!(matches!(
            run("ungated_threshold", &data, &four, &ParamSet::new()),
            Err(PulsedError::Processing(_))
        ));
        let empty = CountData::Ungated(Array1::zeros(100));
        assert!(matches!(
            run("ungated_threshold", &empty, &four, &ParamSet::new()),
            Err(PulsedError::Processing(_))
        ));
    }

    #[test]
    fn known_edges_from_sampling_information() {
        let info = SamplingInformation {
            digital_rising_bins: indexmap! {"d_ch1".to_string() => STARTS.iter().map(|&s| 2 * s as u64).collect()},
            pulse_generator_settings: pulsecompiler_backend::PulseGeneratorSettings {
                sample_rate: 2e9,
                ..Default::default()
            },
            ..Default::default()
        };
        let context = ExtractionContext::new(1e-9, 5, Some(&info), "d_ch1");
        assert_eq!(context.laser_rising_times.len(), 5);

        let trace = five_pulses();
        let data = CountData::Ungated(trace.clone());
        let params = ParamSet::new().with("window_length", 100e-9);
        let result = run("ungated_known_edges", &data, &context, &params).unwrap();
        for (i, &start) in STARTS.iter().enumerate() {
            assert_eq!(result.laser_counts.row(i), trace.slice(s![start..start + 100]));
        }

        // Window defaults to the edge spacing
        let spaced = run("ungated_known_edges", &data, &context, &ParamSet::new()).unwrap();
        assert_eq!(spaced.laser_counts.shape(), &[5, 180]);

        let missing = ExtractionContext::new(1e-9, 5, None, "d_ch1");
        assert!(matches!(
            run("ungated_known_edges", &data, &missing, &ParamSet::new()),
            Err(PulsedError::Processing(_))
        ));
    }

    #[test]
    fn gated_edges_from_the_derivative() {
        let data = CountData::Gated(gated_pulse_trace(5, 500, 100, 200, 10));
        let result = run("gated_conv_deriv", &data, &context(), &ParamSet::new()).unwrap();
        let rising = result.laser_indices_rising[0];
        let falling = result.laser_indices_falling[0];
        assert!((98..=101).contains(&rising), "rising edge at {}", rising);
        assert!((298..=301).contains(&falling), "falling edge at {}", falling);
        assert_eq!(result.laser_counts.nrows(), 5);
        assert_eq!(result.laser_counts.ncols(), falling - rising);
    }

    #[test]
    fn data_kind_must_match_the_method() {
        let gated = CountData::Gated(gated_pulse_trace(2, 100, 10, 20, 5));
        assert!(matches!(
            run("ungated_threshold", &gated, &context(), &ParamSet::new()),
            Err(PulsedError::Configuration(_))
        ));
        let flat = CountData::Gated(Array2::zeros((2, 100)));
        assert!(matches!(
            run("gated_conv_deriv", &flat, &context(), &ParamSet::new()),
            Err(PulsedError::Processing(_))
        ));
    }

    #[test]
    fn parameters_only_reach_the_selected_method() {
        let mut selection = MethodSelection::new(extraction_registry(&[]), "ungated_threshold").unwrap();
        let before = selection.parameters_of("ungated_known_edges").unwrap();
        selection
            .set_parameters(&ParamSet::new().with("delay", 50e-9))
            .unwrap();
        assert_eq!(selection.current_parameters().unwrap().f64("delay").unwrap(), 50e-9);
        assert_eq!(selection.parameters_of("ungated_known_edges").unwrap(), before);
    }

    #[test]
    fn smoothing_keeps_the_total() {
        let data: Vec<f64> = (0..50).map(|i| if i == 25 { 10.0 } else { 0.0 }).collect();
        let smoothed = gaussian_filter(&data, 3.0);
        let total: f64 = smoothed.iter().sum();
        assert!((total - 10.0).abs() < 1e-9);
        assert_eq!(gradient(&[0.0, 1.0, 4.0]), vec![1.0, 2.0, 3.0]);
    }
}
