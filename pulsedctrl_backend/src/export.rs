//! Saving measurement results as pretty-printed JSON.
//!
//! One save writes three files into the target directory, named after the tag:
//! `<tag>_pulsed_measurement.json` (signal and error per controlled variable point),
//! `<tag>_laser_pulses.json` (extracted laser windows) and `<tag>_raw_timetrace.json` (the
//! accumulated counter data).

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use pulsecompiler_backend::error::{PulsedError, Result};

use crate::alternative::AlternativeDataType;
use crate::hardware::CountData;
use crate::measurement::{MeasurementData, MeasurementSettings};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulsedMeasurementRecord {
    pub controlled_variable: Vec<f64>,
    pub units: (String, String),
    pub labels: (String, String),
    pub alternating: bool,
    pub signal: Vec<Vec<f64>>,
    pub error: Vec<Vec<f64>>,
    pub alternative_data_type: AlternativeDataType,
    pub alternative_x: Vec<f64>,
    pub alternative_y: Vec<Vec<f64>>,
    pub elapsed_time: f64,
    pub elapsed_sweeps: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaserPulsesRecord {
    /// Seconds.
    pub bin_width: f64,
    /// Laser x time bin.
    pub laser_data: Vec<Vec<u64>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawTimetraceRecord {
    /// Seconds.
    pub bin_width: f64,
    pub gated: bool,
    /// A single row for ungated counters.
    pub counts: Vec<Vec<u64>>,
    pub elapsed_sweeps: u64,
}

fn rows<T: Clone>(array: &Array2<T>) -> Vec<Vec<T>> {
    array.outer_iter().map(|row| row.to_vec()).collect()
}

fn write_json<T: Serialize>(dir: &Path, tag: &str, suffix: &str, record: &T) -> Result<PathBuf> {
    let path = dir.join(format!("{}_{}.json", tag, suffix));
    let text = serde_json::to_string_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Writes the three result files and returns their paths.
pub fn save_measurement_data(
    dir: &Path,
    tag: &str,
    data: &MeasurementData,
    settings: &MeasurementSettings,
    bin_width: f64,
) -> Result<Vec<PathBuf>> {
    if tag.is_empty() || tag.contains(['/', '\\']) || tag.starts_with('.') {
        return Err(PulsedError::config(format!("'{}' can not be used as a file name tag", tag)));
    }
    fs::create_dir_all(dir)?;

    let (alternative_data_type, alternative_x, alternative_y) = match &data.alt_data {
        Some(alt) => (alt.data_type, alt.x.to_vec(), rows(&alt.y)),
        None => (AlternativeDataType::None, Vec::new(), Vec::new()),
    };
    let measurement = PulsedMeasurementRecord {
        controlled_variable: data.controlled_variable.to_vec(),
        units: settings.units.clone(),
        labels: settings.labels.clone(),
        alternating: settings.alternating,
        signal: rows(&data.signal),
        error: rows(&data.error),
        alternative_data_type,
        alternative_x,
        alternative_y,
        elapsed_time: data.elapsed_time,
        elapsed_sweeps: data.elapsed_sweeps,
    };
    let lasers = LaserPulsesRecord {
        bin_width,
        laser_data: rows(&data.laser_data),
    };
    let raw = RawTimetraceRecord {
        bin_width,
        gated: data.raw_data.is_gated(),
        counts: match &data.raw_data {
            CountData::Ungated(trace) => vec![trace.to_vec()],
            CountData::Gated(trace) => rows(trace),
        },
        elapsed_sweeps: data.elapsed_sweeps,
    };

    let paths = vec![
        write_json(dir, tag, "pulsed_measurement", &measurement)?,
        write_json(dir, tag, "laser_pulses", &lasers)?,
        write_json(dir, tag, "raw_timetrace", &raw)?,
    ];
    tracing::info!("Saved measurement data {} to {}", tag, dir.display());
    Ok(paths)
}
