use anyhow::Result;
use log::info;
use std::env;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    // Initialize logging
    facecoder::logging::init_logger();

    // Get config path from args
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <config.yaml>", args[0]);
        eprintln!("Example: {} config/celeba-encoder.yaml", args[0]);
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    // Check if file exists
    if !config_path.exists() {
        eprintln!("Error: Config file not found: {}", config_path.display());
        std::process::exit(1);
    }

    info!("Starting trainer with config: {}", config_path.display());

    let config = facecoder::load_config(&config_path)?;
    let device = facecoder::trainers::resolve_device(&config)?;
    let dataset =
        facecoder::data::loader::load_dataset(Path::new(&config.data.dataset_path), &device)?;

    let mut trainer = facecoder::EncoderTrainer::new(&config, dataset, device)?;
    trainer.train()?;

    info!("Training completed successfully");
    Ok(())
}
