use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pulsecompiler_backend::dummy_pulser::DummyPulser;
use pulsecompiler_backend::generator::AssetKind;
use pulsecompiler_backend::params::ParamSet;
use pulsedctrl_backend::dummy_hardware::{laser_pulse_trace, DummyCounter, DummyMicrowave};
use pulsedctrl_backend::*;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pulsedctrl_backend=debug")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PulsedConfig::load_or_default(path),
        None => PulsedConfig {
            timer_interval_s: 0.1,
            ..Default::default()
        },
    };

    let counter = DummyCounter::new(false);
    let counter_handle = counter.handle();
    let coordinator = Coordinator::spawn(
        Box::new(DummyPulser::default()),
        Box::new(counter),
        Some(Box::new(DummyMicrowave::default())),
        &config,
    )?;

    let produced = coordinator.generate_predefined_blocking(
        "rabi",
        "rabi",
        ParamSet::new().with("number_of_taus", 20i64),
    )?;
    tracing::info!("Generated {:?}", produced);
    let info = coordinator.sample_and_load_blocking("rabi", AssetKind::Ensemble)?;

    // Let the dummy counter see a laser pulse at every rising edge of the laser channel
    let laser_channel = &config.generation.laser_channel;
    let edges: Vec<usize> = info
        .digital_rising_bins
        .get(laser_channel)
        .map(|bins| bins.iter().map(|&b| b as usize).collect())
        .unwrap_or_default();
    let pulse_bins = (config.generation.laser_length * info.sample_rate()) as usize;
    counter_handle.lock().sweep_pattern = Some(CountData::Ungated(laser_pulse_trace(
        info.number_of_samples as usize,
        &edges,
        pulse_bins,
        20,
        1,
    )));

    let updates = coordinator.updates();
    coordinator.start_measurement_blocking(None)?;
    let mut refreshes = 0;
    while refreshes < 5 {
        match updates.recv_timeout(Duration::from_secs(5)) {
            Ok(MeasurementUpdate::Data(data)) => {
                refreshes += 1;
                tracing::info!(
                    "Sweep {}: signal of the first tau {:.3}",
                    data.elapsed_sweeps,
                    data.signal[[0, 0]]
                );
            }
            Ok(MeasurementUpdate::Failed(reason)) => tracing::warn!("Refresh failed: {}", reason),
            Ok(MeasurementUpdate::State(state)) => tracing::info!("Measurement is {:?}", state),
            Err(_) => break,
        }
    }
    coordinator.stop_measurement_blocking(Some("rabi"))?;
    let data = coordinator.measurement_data_blocking()?;
    tracing::info!(
        "Finished after {} sweeps and {:.2} s",
        data.elapsed_sweeps,
        data.elapsed_time
    );
    match coordinator.save_measurement_data("rabi", None) {
        Ok(pending) => tracing::info!("Saved {:?}", pending.wait()?),
        Err(err) => tracing::info!("Results not saved: {}", err),
    }
    coordinator.shutdown()
}
