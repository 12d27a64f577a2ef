//! Contracts of the hardware the measurement side drives: a fast counter and an optional
//! microwave source. Both are owned by the measurement worker thread.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use pulsecompiler_backend::error::{PulsedError, Result};

/// Raw photon counts of one acquisition.
#[derive(Clone, Debug, PartialEq)]
pub enum CountData {
    /// One continuous trace, indexed by time bin.
    Ungated(Array1<u64>),
    /// Gate index x time bin.
    Gated(Array2<u64>),
}

impl CountData {
    pub fn zeros(number_of_gates: usize, number_of_bins: usize) -> Self {
        if number_of_gates == 0 {
            CountData::Ungated(Array1::zeros(number_of_bins))
        } else {
            CountData::Gated(Array2::zeros((number_of_gates, number_of_bins)))
        }
    }

    pub fn is_gated(&self) -> bool {
        matches!(self, CountData::Gated(_))
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            CountData::Ungated(trace) => trace.shape().to_vec(),
            CountData::Gated(trace) => trace.shape().to_vec(),
        }
    }

    pub fn is_all_zero(&self) -> bool {
        match self {
            CountData::Ungated(trace) => trace.iter().all(|&c| c == 0),
            CountData::Gated(trace) => trace.iter().all(|&c| c == 0),
        }
    }

    pub fn total_counts(&self) -> u64 {
        match self {
            CountData::Ungated(trace) => trace.sum(),
            CountData::Gated(trace) => trace.sum(),
        }
    }

    /// Element-wise sum, `None` if the shapes differ.
    pub fn added(&self, other: &CountData) -> Option<CountData> {
        match (self, other) {
            (CountData::Ungated(a), CountData::Ungated(b)) if a.shape() == b.shape() => {
                Some(CountData::Ungated(a + b))
            }
            (CountData::Gated(a), CountData::Gated(b)) if a.shape() == b.shape() => {
                Some(CountData::Gated(a + b))
            }
            _ => None,
        }
    }
}

/// Counter acquisition settings. `number_of_gates == 0` means ungated counting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterSettings {
    /// Seconds.
    pub bin_width: f64,
    /// Seconds.
    pub record_length: f64,
    pub number_of_gates: usize,
}

impl Default for CounterSettings {
    fn default() -> Self {
        CounterSettings {
            bin_width: 1e-9,
            record_length: 3e-6,
            number_of_gates: 0,
        }
    }
}

impl CounterSettings {
    pub fn number_of_bins(&self) -> usize {
        if self.bin_width <= 0.0 {
            return 0;
        }
        (self.record_length / self.bin_width).round() as usize
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CounterConstraints {
    /// Selectable bin widths, seconds.
    pub bin_widths: Vec<f64>,
    /// Seconds.
    pub max_record_length: f64,
    pub max_gates: usize,
}

/// One trace read plus the accumulation state the counter reports, if it tracks it.
#[derive(Clone, Debug, PartialEq)]
pub struct CounterTrace {
    pub data: CountData,
    pub elapsed_sweeps: Option<u64>,
    pub elapsed_time: Option<f64>,
}

pub trait FastCounter: Send {
    fn constraints(&self) -> CounterConstraints;
    fn is_gated(&self) -> bool;

    /// Applies the settings and returns what the device actually uses.
    fn configure(&mut self, settings: &CounterSettings) -> Result<CounterSettings>;

    /// Accumulated counts since the last `start`.
    fn get_trace(&mut self) -> Result<CounterTrace>;

    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEdge {
    Rising,
    Falling,
}

/// Trigger timing of a microwave source synchronized to the pulse generator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerTiming {
    pub edge: TriggerEdge,
    /// Delay between trigger and output, seconds.
    pub delay: f64,
}

/// Settings of an external continuous-wave microwave source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrowaveSettings {
    /// Whether the source is switched together with the measurement.
    pub use_ext_microwave: bool,
    /// Hz.
    pub frequency: f64,
    /// dBm.
    pub power: f64,
    pub trigger_timing: Option<TriggerTiming>,
}

impl Default for MicrowaveSettings {
    fn default() -> Self {
        MicrowaveSettings {
            use_ext_microwave: false,
            frequency: 2.87e9,
            power: -30.0,
            trigger_timing: None,
        }
    }
}

pub trait MicrowaveSource: Send {
    /// Sets frequency and power, returns the values the device uses.
    fn set_cw(&mut self, frequency: f64, power: f64) -> Result<(f64, f64)>;
    fn set_trigger_timing(&mut self, timing: &TriggerTiming) -> Result<TriggerTiming>;
    fn on(&mut self) -> Result<()>;
    fn off(&mut self) -> Result<()>;
    fn is_on(&self) -> bool;
}

/// Checks requested counter settings against the device limits.
pub fn check_counter_settings(
    settings: &CounterSettings,
    constraints: &CounterConstraints,
    gated: bool,
) -> Result<()> {
    if !(settings.bin_width > 0.0) || !(settings.record_length > 0.0) {
        return Err(PulsedError::config(format!(
            "Bin width {} s and record length {} s must both be positive",
            settings.bin_width, settings.record_length
        )));
    }
    if settings.record_length > constraints.max_record_length {
        return Err(PulsedError::config(format!(
            "Record length {} s exceeds the counter maximum of {} s",
            settings.record_length, constraints.max_record_length
        )));
    }
    if gated && settings.number_of_gates == 0 {
        return Err(PulsedError::config("A gated counter needs at least one gate"));
    }
    if settings.number_of_gates > constraints.max_gates {
        return Err(PulsedError::ResourceExceeded {
            what: "number of gates".to_string(),
            requested: settings.number_of_gates as u64,
            limit: constraints.max_gates as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn count_data_arithmetic() {
        let a = CountData::Ungated(array![1, 2, 3]);
        let b = CountData::Ungated(array![1, 0, 1]);
        assert_eq!(a.added(&b), Some(CountData::Ungated(array![2, 2, 4])));
        assert_eq!(a.added(&CountData::Ungated(array![1])), None);
        assert_eq!(a.added(&CountData::zeros(2, 3)), None);
        assert!(CountData::zeros(2, 3).is_all_zero());
        assert_eq!(CountData::zeros(2, 3).shape(), vec![2, 3]);
        assert_eq!(a.total_counts(), 6);
    }

    #[test]
    fn counter_settings_are_checked() {
        let constraints = CounterConstraints {
            bin_widths: vec![1e-9],
            max_record_length: 1e-3,
            max_gates: 100,
        };
        let ok = CounterSettings::default();
        assert_eq!(ok.number_of_bins(), 3000);
        assert!(check_counter_settings(&ok, &constraints, false).is_ok());
        assert!(matches!(
            check_counter_settings(&ok, &constraints, true),
            Err(PulsedError::Configuration(_))
        ));
        let too_long = CounterSettings {
            record_length: 1.0,
            ..ok.clone()
        };
        assert!(check_counter_settings(&too_long, &constraints, false).is_err());
        let gates = CounterSettings {
            number_of_gates: 101,
            ..ok
        };
        assert!(matches!(
            check_counter_settings(&gates, &constraints, true),
            Err(PulsedError::ResourceExceeded { .. })
        ));
    }
}
