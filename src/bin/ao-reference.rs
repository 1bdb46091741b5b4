use ao_loop::{
    devices::Camera,
    reference::{self, ReferenceGenerator},
    sim::SimulatedBench,
    textfile::{self, TextFormat},
    Config,
};
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    env_logger::builder().format_target(false).init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_toml(path)?,
        None => Config::default(),
    };

    let mut bench = SimulatedBench::builder(&config).aberration(0.).build()?;
    let mask = match config.paths.reference_mask.as_ref() {
        Some(path) => textfile::load_mask(path)?,
        None => {
            bench
                .camera
                .search_geometry()
                .ok_or_else(|| anyhow::anyhow!("no reference mask configured"))?
                .1
        }
    };

    let n = config.sensor.reference_n_measurements;
    let frame = reference::average_frames(&mut bench.camera, n)?;
    log::info!("{n} frames averaged");
    let geometry = ReferenceGenerator::new(&config.sensor).generate(&frame, &mask)?;

    let dir = config
        .paths
        .reference_directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;
    let stamp = textfile::now_string(false);
    let coords = dir.join(format!("{stamp}_coords.txt"));
    reference::save_coordinates(&coords, &geometry, TextFormat::Fixed(2))?;
    textfile::save_mask(dir.join(format!("{stamp}_mask.txt")), &mask)?;
    println!("{} reference spots saved to {coords:?}", geometry.n());
    Ok(())
}
