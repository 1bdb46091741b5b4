use ao_loop::{
    calibration::PokeStimulus,
    centroiding::CenterOfMass,
    controller::{ClosedLoop, Running},
    devices::Camera,
    sensor::{SensorSnapshot, WavefrontSensor},
    sim::{FaultInjector, LowOrderReconstructor, SimulatedBench},
    AoError, Config,
};
use std::{path::PathBuf, time::Duration};

fn config() -> Config {
    let mut config = Config::default();
    let sensor = &mut config.sensor;
    sensor.image_width_px = 200;
    sensor.image_height_px = 200;
    sensor.lenslet_pitch_m = 20. * sensor.pixel_size_m;
    sensor.beam_diameter_m = 8. * sensor.lenslet_pitch_m;
    sensor.search_box_half_width = 8.;
    config.mirror.n_actuators = 25;
    config.mirror.settling_time_s = 0.;
    config.control.n_control_modes = 20;
    config.control.quiesce_s = 0.01;
    config
}

fn temp_dir(name: &str) -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("ao-loop-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn start(config: &Config, aberration: f64) -> anyhow::Result<(ClosedLoop<Running>, FaultInjector)> {
    start_with(config, aberration, false)
}

fn start_with(
    config: &Config,
    aberration: f64,
    reconstruct: bool,
) -> anyhow::Result<(ClosedLoop<Running>, FaultInjector)> {
    let bench = SimulatedBench::builder(config)
        .aberration(aberration)
        .build()?;
    let (geometry, lenslet_mask) = bench
        .camera
        .search_geometry()
        .ok_or_else(|| anyhow::anyhow!("no search boxes"))?;
    let centroider = CenterOfMass::new(config.sensor.centroiding_num_threads)?;
    let mut sensor = WavefrontSensor::new(Box::new(bench.camera), Box::new(centroider), config)?;
    if reconstruct {
        let reconstructor = LowOrderReconstructor::new(&geometry, &lenslet_mask, &config.sensor)?;
        sensor = sensor.reconstructor(Box::new(reconstructor));
    }
    let ao = ClosedLoop::new(sensor, Box::new(bench.mirror), config)?.start();
    Ok((ao, bench.faults))
}

fn slopes_rms(x: &[f64], y: &[f64]) -> f64 {
    let n = (x.len() + y.len()) as f64;
    (x.iter().chain(y).map(|s| s * s).sum::<f64>() / n).sqrt()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flat_wavefront_keeps_the_mirror_flat() -> anyhow::Result<()> {
    let mut config = config();
    let dir = temp_dir("flat")?;
    config.paths.poke_directory = Some(dir.clone());
    let (mut ao, _) = start(&config, 0.)?;

    let calibration = ao
        .run_poke_calibration(&PokeStimulus::try_from(&config.poke)?)
        .await?;
    assert!(calibration.cond >= 1.);
    assert!(!calibration.poke.is_placeholder());
    let files = calibration.files.expect("calibration files");
    assert!(files.poke.exists() && files.currents.exists());

    ao.set_closed(true).await;
    ao.wait_cycles(20).await?;
    let command = ao.command().await;
    assert!(command.iter().all(|c| c.abs() < 1e-6), "{command:?}");

    ao.shutdown().await?;
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_loop_nulls_the_slopes() -> anyhow::Result<()> {
    let config = config();
    let (mut ao, _) = start(&config, 1.)?;
    ao.wait_cycles(3).await?;
    let open = ao.sensor_snapshot().await;
    let open_rms = slopes_rms(&open.x_slopes, &open.y_slopes);
    assert!(open_rms > 0.);

    ao.run_poke_calibration(&PokeStimulus::try_from(&config.poke)?)
        .await?;
    assert_eq!(ao.n_modes().await, Some(20));
    ao.set_closed(true).await;
    ao.wait_cycles(60).await?;
    let closed = ao.sensor_snapshot().await;
    let closed_rms = slopes_rms(&closed.x_slopes, &closed.y_slopes);
    assert!(
        closed_rms < 0.5 * open_rms,
        "open loop: {open_rms:.3e}, closed loop: {closed_rms:.3e}"
    );
    assert!(ao.command().await.iter().any(|c| *c != 0.));

    ao.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_stops_cycling() -> anyhow::Result<()> {
    let (mut ao, _) = start(&config(), 1.)?;
    ao.wait_cycles(2).await?;
    ao.pause().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let n = ao.n_cycle();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ao.n_cycle(), n);
    ao.unpause().await;
    assert!(ao.wait_cycles(2).await? >= n + 2);
    ao.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_calibration_keeps_the_previous_poke() -> anyhow::Result<()> {
    let config = config();
    let (mut ao, faults) = start(&config, 1.)?;
    ao.wait_cycles(2).await?;
    ao.pause().await;
    faults.fail_next(1);

    let result = ao
        .run_poke_calibration(&PokeStimulus::try_from(&config.poke)?)
        .await;
    assert!(matches!(result, Err(AoError::Hardware(_))));
    assert!(ao.poke().await.is_placeholder());
    assert!(!ao.is_paused());
    assert!(ao.command().await.iter().all(|c| *c == 0.));

    // dropped frames skip cycles without stopping the loop
    faults.fail_next(3);
    ao.wait_cycles(5).await?;
    ao.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invert_resumes_the_loop() -> anyhow::Result<()> {
    let config = config();
    let (mut ao, _) = start(&config, 1.)?;
    ao.run_poke_calibration(&PokeStimulus::try_from(&config.poke)?)
        .await?;
    let cond = ao.condition_number().await;

    let n = ao.n_cycle();
    let reinverted = ao.invert().await?;
    assert!(reinverted >= 1.);
    assert!((reinverted - cond).abs() < 1e-9 * cond);
    assert_eq!(ao.condition_number().await, reinverted);
    assert!(!ao.is_paused());
    assert!(ao.wait_cycles(2).await? >= n + 2);

    ao.pause().await;
    ao.invert().await?;
    assert!(!ao.is_paused());
    ao.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mode_retention() -> anyhow::Result<()> {
    let config = config();
    let (mut ao, _) = start(&config, 1.)?;
    ao.run_poke_calibration(&PokeStimulus::try_from(&config.poke)?)
        .await?;
    let cond_20 = ao.condition_number().await;
    assert!(cond_20 >= 1.);

    ao.set_n_modes(5).await?;
    assert_eq!(ao.n_modes().await, Some(5));
    let cond_5 = ao.condition_number().await;
    assert!((1. ..=cond_20).contains(&cond_5), "{cond_5} > {cond_20}");

    ao.set_condition_cutoff(10.).await?;
    assert_eq!(ao.n_modes().await, None);
    let cond = ao.condition_number().await;
    assert!((1. ..10.).contains(&cond), "{cond}");

    assert!(matches!(
        ao.set_n_modes(0).await,
        Err(AoError::Configuration(_))
    ));
    assert!(matches!(
        ao.set_condition_cutoff(0.5).await,
        Err(AoError::Configuration(_))
    ));
    assert!(matches!(
        ao.set_condition_cutoff(f64::NAN).await,
        Err(AoError::Configuration(_))
    ));
    assert_eq!(ao.condition_number().await, cond);

    ao.wait_cycles(2).await?;
    ao.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reference_is_saved_with_two_decimals() -> anyhow::Result<()> {
    let mut config = config();
    let dir = temp_dir("reference")?;
    config.paths.reference_directory = Some(dir.clone());
    config.sensor.reference_n_measurements = 3;
    let (mut ao, _) = start(&config, 1.)?;
    ao.wait_cycles(2).await?;

    let (x, y) = ao.record_reference().await?;
    assert!(!ao.is_paused());
    let geometry = ao.geometry().await;
    assert_eq!(geometry.x(), x.as_slice());
    assert_eq!(geometry.y(), y.as_slice());

    let coords = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| path.to_string_lossy().ends_with("_coords.txt"))
        .ok_or_else(|| anyhow::anyhow!("no coordinates file in {dir:?}"))?;
    let contents = std::fs::read_to_string(&coords)?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), x.len());
    for (line, (x, y)) in lines.iter().zip(x.iter().zip(&y)) {
        let values: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(values.len(), 2, "{line}");
        for value in &values {
            let (_, decimals) = value.split_once('.').unwrap_or_default();
            assert_eq!(decimals.len(), 2, "{line}");
        }
        assert!((values[0].parse::<f64>()? - x).abs() <= 0.005);
        assert!((values[1].parse::<f64>()? - y).abs() <= 0.005);
    }

    // the sensor keeps running from the new reference
    let n = ao.n_cycle();
    assert!(ao.wait_cycles(2).await? >= n + 2);
    ao.shutdown().await?;
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn defocus_moves_the_search_boxes() -> anyhow::Result<()> {
    let config = config();
    let (mut ao, _) = start_with(&config, 0., true)?;
    ao.wait_cycles(2).await?;
    let origin = ao.geometry().await;

    ao.set_defocus(1.).await?;
    let defocused = ao.geometry().await;
    assert!(origin
        .x()
        .iter()
        .zip(defocused.x())
        .any(|(a, b)| (a - b).abs() > 1e-6));
    assert_eq!(defocused.half_width(), origin.half_width());
    assert!(!ao.is_paused());

    ao.set_defocus(0.).await?;
    let restored = ao.geometry().await;
    assert!(origin
        .x()
        .iter()
        .zip(restored.x())
        .chain(origin.y().iter().zip(restored.y()))
        .all(|(a, b)| (a - b).abs() < 1e-9));
    ao.shutdown().await?;

    let (ao, _) = start(&config, 0.)?;
    assert!(matches!(
        ao.set_defocus(1.).await,
        Err(AoError::Configuration(_))
    ));
    ao.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sensor_snapshots_are_logged() -> anyhow::Result<()> {
    let config = config();
    let (ao, _) = start(&config, 1.)?;
    assert!(matches!(
        ao.set_logging(true).await,
        Err(AoError::Configuration(_))
    ));
    ao.shutdown().await?;

    let mut config = self::config();
    let dir = temp_dir("logging")?;
    config.paths.logging_directory = Some(dir.clone());
    let (mut ao, _) = start(&config, 1.)?;
    ao.set_logging(true).await?;
    ao.wait_cycles(3).await?;
    ao.set_logging(false).await?;

    let mut logs: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy())
                .is_some_and(|name| name.starts_with("sensor_") && name.ends_with(".bin"))
        })
        .collect();
    logs.sort();
    assert!(logs.len() >= 2, "{logs:?}");
    let n = ao.geometry().await.n();
    let snapshot: SensorSnapshot = bincode::deserialize(&std::fs::read(&logs[0])?)?;
    assert_eq!(snapshot.x_slopes.len(), n);
    assert_eq!(snapshot.y_centroids.len(), n);
    assert_eq!(snapshot.search_box_x1.len(), n);
    assert_eq!(snapshot.ref_x.len(), n);
    assert!(snapshot.x_slopes.iter().any(|s| *s != 0.));

    ao.shutdown().await?;
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
