use ao_loop::{
    calibration::PokeStimulus,
    centroiding::CenterOfMass,
    controller::ClosedLoop,
    devices::Camera,
    sensor::WavefrontSensor,
    sim::{LowOrderReconstructor, SimulatedBench},
    Config,
};

const N_CYCLE: usize = 200;

fn rms(x: &[f64], y: &[f64]) -> f64 {
    let n = (x.len() + y.len()) as f64;
    (x.iter().chain(y).map(|s| s * s).sum::<f64>() / n).sqrt()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder().format_target(false).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => Config::from_toml(path)?,
        None => Config::default(),
    };
    let n_cycle = match args.next() {
        Some(n) => n.parse()?,
        None => N_CYCLE,
    };

    let bench = SimulatedBench::new(&config)?;
    let (geometry, lenslet_mask) = bench
        .camera
        .search_geometry()
        .ok_or_else(|| anyhow::anyhow!("the simulated camera has no search boxes"))?;
    let reconstructor = LowOrderReconstructor::new(&geometry, &lenslet_mask, &config.sensor)?;
    let centroider = CenterOfMass::new(config.sensor.centroiding_num_threads)?;
    let sensor = WavefrontSensor::new(Box::new(bench.camera), Box::new(centroider), &config)?
        .reconstructor(Box::new(reconstructor));

    let mut ao = ClosedLoop::new(sensor, Box::new(bench.mirror), &config)?.start();
    ao.wait_cycles(10).await?;
    let open = ao.sensor_snapshot().await;
    log::info!(
        "open loop: slopes RMS {:.3e}rd, wavefront RMS {:.3e}m",
        rms(&open.x_slopes, &open.y_slopes),
        open.error.unwrap_or_default()
    );

    let calibration = ao
        .run_poke_calibration(&PokeStimulus::try_from(&config.poke)?)
        .await?;
    log::info!("control matrix condition number: {:.3}", calibration.cond);

    ao.set_closed(true).await;
    ao.wait_cycles(n_cycle).await?;
    let closed = ao.sensor_snapshot().await;
    log::info!(
        "closed loop: slopes RMS {:.3e}rd, wavefront RMS {:.3e}m",
        rms(&closed.x_slopes, &closed.y_slopes),
        closed.error.unwrap_or_default()
    );

    let ao = ao.shutdown().await?;
    println!("{} cycles, final command: {:.3?}", ao.n_cycle(), ao.command().await);
    Ok(())
}
