//! In-memory counter and microwave source for tests and the demo binary.
//!
//! Like the dummy pulse generator, the device state sits behind an `Arc<Mutex<_>>` so tests can
//! script it and read the call log while the device itself is owned by a worker thread.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use parking_lot::Mutex;

use pulsecompiler_backend::error::{PulsedError, Result};

use crate::hardware::*;

#[derive(Debug)]
pub struct DummyCounterState {
    pub settings: CounterSettings,
    pub constraints: CounterConstraints,
    pub gated: bool,
    pub running: bool,
    pub paused: bool,
    /// Counts added to the accumulated data on every read while running.
    pub sweep_pattern: Option<CountData>,
    pub accumulated: Option<CountData>,
    pub sweeps: u64,
    pub reads: usize,
    /// `get_trace` fails from this (1-based) read on.
    pub fail_from_read: Option<usize>,
    pub call_log: Vec<String>,
}

pub type DummyCounterHandle = Arc<Mutex<DummyCounterState>>;

pub struct DummyCounter {
    state: DummyCounterHandle,
}

impl DummyCounter {
    pub fn new(gated: bool) -> Self {
        let settings = CounterSettings {
            number_of_gates: if gated { 1 } else { 0 },
            ..Default::default()
        };
        let state = DummyCounterState {
            settings,
            constraints: CounterConstraints {
                bin_widths: vec![1e-9, 2e-9, 4e-9, 8e-9, 16e-9],
                max_record_length: 10e-3,
                max_gates: 1000,
            },
            gated,
            running: false,
            paused: false,
            sweep_pattern: None,
            accumulated: None,
            sweeps: 0,
            reads: 0,
            fail_from_read: None,
            call_log: Vec::new(),
        };
        DummyCounter {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn handle(&self) -> DummyCounterHandle {
        self.state.clone()
    }
}

impl Default for DummyCounter {
    fn default() -> Self {
        DummyCounter::new(false)
    }
}

impl FastCounter for DummyCounter {
    fn constraints(&self) -> CounterConstraints {
        self.state.lock().constraints.clone()
    }

    fn is_gated(&self) -> bool {
        self.state.lock().gated
    }

    fn configure(&mut self, settings: &CounterSettings) -> Result<CounterSettings> {
        let mut state = self.state.lock();
        state.call_log.push(format!(
            "configure {} {} {}",
            settings.bin_width, settings.record_length, settings.number_of_gates
        ));
        if state.running {
            return Err(PulsedError::hardware("counter is busy"));
        }
        check_counter_settings(settings, &state.constraints, state.gated)?;
        let bin_width = state
            .constraints
            .bin_widths
            .iter()
            .copied()
            .min_by(|a, b| (a - settings.bin_width).abs().total_cmp(&(b - settings.bin_width).abs()))
            .unwrap_or(settings.bin_width);
        state.settings = CounterSettings {
            bin_width,
            record_length: settings.record_length,
            number_of_gates: if state.gated { settings.number_of_gates } else { 0 },
        };
        state.accumulated = None;
        Ok(state.settings.clone())
    }

    fn get_trace(&mut self) -> Result<CounterTrace> {
        let mut state = self.state.lock();
        state.reads += 1;
        state.call_log.push("get_trace".to_string());
        if let Some(from) = state.fail_from_read {
            if state.reads >= from {
                return Err(PulsedError::hardware("counter did not answer"));
            }
        }
        if state.running && !state.paused {
            if let Some(pattern) = state.sweep_pattern.clone() {
                let next = match &state.accumulated {
                    Some(acc) => acc.added(&pattern).unwrap_or(pattern),
                    None => pattern,
                };
                state.accumulated = Some(next);
                state.sweeps += 1;
            }
        }
        let data = match &state.accumulated {
            Some(data) => data.clone(),
            None => CountData::zeros(state.settings.number_of_gates, state.settings.number_of_bins()),
        };
        Ok(CounterTrace {
            data,
            elapsed_sweeps: Some(state.sweeps),
            elapsed_time: None,
        })
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.call_log.push("start".to_string());
        state.running = true;
        state.paused = false;
        state.accumulated = None;
        state.sweeps = 0;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.call_log.push("stop".to_string());
        state.running = false;
        state.paused = false;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.call_log.push("pause".to_string());
        state.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.call_log.push("resume".to_string());
        state.paused = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DummyMicrowaveState {
    pub frequency: f64,
    pub power: f64,
    pub trigger_timing: Option<TriggerTiming>,
    pub on: bool,
    pub fail: bool,
    pub call_log: Vec<String>,
}

pub type DummyMicrowaveHandle = Arc<Mutex<DummyMicrowaveState>>;

#[derive(Default)]
pub struct DummyMicrowave {
    state: DummyMicrowaveHandle,
}

impl DummyMicrowave {
    pub fn handle(&self) -> DummyMicrowaveHandle {
        self.state.clone()
    }

    fn check(state: &mut DummyMicrowaveState, call: &str) -> Result<()> {
        state.call_log.push(call.to_string());
        if state.fail {
            return Err(PulsedError::hardware(format!("microwave source rejected {}", call)));
        }
        Ok(())
    }
}

impl MicrowaveSource for DummyMicrowave {
    fn set_cw(&mut self, frequency: f64, power: f64) -> Result<(f64, f64)> {
        let mut state = self.state.lock();
        Self::check(&mut state, "set_cw")?;
        state.frequency = frequency;
        state.power = power.min(25.0);
        Ok((state.frequency, state.power))
    }

    fn set_trigger_timing(&mut self, timing: &TriggerTiming) -> Result<TriggerTiming> {
        let mut state = self.state.lock();
        Self::check(&mut state, "set_trigger_timing")?;
        state.trigger_timing = Some(timing.clone());
        Ok(timing.clone())
    }

    fn on(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&mut state, "on")?;
        state.on = true;
        Ok(())
    }

    fn off(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&mut state, "off")?;
        state.on = false;
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.state.lock().on
    }
}

/// Ungated trace with `length` bins at `level` counts from each of `starts`, `background`
/// elsewhere.
pub fn laser_pulse_trace(
    number_of_bins: usize,
    starts: &[usize],
    length: usize,
    level: u64,
    background: u64,
) -> Array1<u64> {
    let mut trace = Array1::from_elem(number_of_bins, background);
    for &start in starts {
        let end = (start + length).min(number_of_bins);
        for bin in start.min(end)..end {
            trace[bin] = level;
        }
    }
    trace
}

/// Gated trace where every gate sees the same laser pulse.
pub fn gated_pulse_trace(
    number_of_gates: usize,
    number_of_bins: usize,
    start: usize,
    length: usize,
    level: u64,
) -> Array2<u64> {
    let row = laser_pulse_trace(number_of_bins, &[start], length, level, 0);
    Array2::from_shape_fn((number_of_gates, number_of_bins), |(_, bin)| row[bin])
}
