use anyhow::Result;
use log::info;
use tch::Device;

use albert_core::PretrainConfig;
use pretrain::{MaskedDataset, Pretrainer, RunConfig, RunMode};

fn main() -> Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/pretrain.yaml".to_string());
    let config = PretrainConfig::from_file(&config_path)?;

    let device = Device::cuda_if_available();
    info!("using device: {:?}", device);

    // Mask roughly 15% of each window; the highest vocabulary id serves as
    // the mask token.
    let max_predictions = (config.max_length() * 15 / 100).max(1) as usize;
    let mask_token_id = config.vocab_size() - 1;
    let dataset = MaskedDataset::from_file(
        config.data_path(),
        config.max_length() as usize,
        max_predictions,
        mask_token_id,
        config.reverse(),
        device,
    )?;
    info!(
        "loaded {} tokens from {:?} ({} task)",
        dataset.len(),
        config.data_path(),
        config.train_type()
    );

    let mut trainer = Pretrainer::new(config, RunConfig::default(), RunMode::Train, device)?;
    trainer.run(&dataset)?;

    info!("training complete at step {}", trainer.global_step());
    Ok(())
}
