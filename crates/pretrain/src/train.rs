use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use tch::{nn, nn::OptimizerConfig, Device, Tensor};

use albert_core::{AlbertEncoder, PretrainConfig};

use crate::batch::{MaskedDataset, MlmBatch};
use crate::checkpoint;
use crate::gather::gather_indexes;
use crate::mlm::{masked_lm_loss, MaskedLmHead};
use crate::schedule::{clip_global_norm, polynomial_decay};

/// Ceiling on the global L2 norm of the gradients, applied every step.
pub const GRADIENT_CLIP_NORM: f64 = 5.0;

/// Operating mode, chosen once per `Pretrainer` and never switched at
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    Eval,
    Predict,
}

/// Checkpointing cadence.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Save a checkpoint every this many completed steps.
    pub save_every_steps: i64,
    /// How many recent checkpoints to retain.
    pub keep_checkpoint_max: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            save_every_steps: 5,
            keep_checkpoint_max: 5,
        }
    }
}

/// What one dispatched step produced.
#[derive(Debug)]
pub enum StepOutput {
    /// Scalar training loss (TRAIN).
    Loss(f64),
    /// Arg-max vocabulary ids per prediction slot, [batch * max_predictions]
    /// (PREDICT).
    Predictions(Tensor),
}

/// Drives masked-LM pretraining: encoder → gather → projection head → loss,
/// with a linearly decaying learning rate, global-norm gradient clipping,
/// and periodic checkpointing.
pub struct Pretrainer {
    config: PretrainConfig,
    run_config: RunConfig,
    mode: RunMode,
    vs: nn::VarStore,
    encoder: AlbertEncoder,
    head: MaskedLmHead,
    optimizer: nn::Optimizer,
    global_step: i64,
    warm_started: bool,
}

impl Pretrainer {
    pub fn new(
        config: PretrainConfig,
        run_config: RunConfig,
        mode: RunMode,
        device: Device,
    ) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let encoder = AlbertEncoder::new(&(&root / "encoder"), &config);
        let head = MaskedLmHead::new(&(&root / "mlm"), &config);
        drop(root);

        let optimizer = nn::AdamW::default()
            .build(&vs, config.learning_rate())
            .context("failed to build optimizer")?;

        Ok(Self {
            config,
            run_config,
            mode,
            vs,
            encoder,
            head,
            optimizer,
            global_step: 0,
            warm_started: false,
        })
    }

    pub fn global_step(&self) -> i64 {
        self.global_step
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Restores parameters from `init_checkpoint`, at most once per process
    /// and always before the first optimizer update. A configured but
    /// missing or unreadable checkpoint aborts startup; no configured path
    /// means a cold start and is not an error. Parameters absent from the
    /// checkpoint keep their initializer values.
    pub fn warm_start(&mut self) -> Result<()> {
        if self.warm_started {
            return Ok(());
        }

        let init_checkpoint: Option<PathBuf> =
            self.config.init_checkpoint().map(|p| p.to_path_buf());
        let path = match init_checkpoint {
            Some(path) => path,
            None => {
                debug!("no init_checkpoint configured, cold start");
                self.warm_started = true;
                return Ok(());
            }
        };

        let stored = checkpoint::list_tensors(&path)
            .with_context(|| format!("cannot warm-start from {:?}", path))?;
        let mut live_names: Vec<String> = self.vs.variables().keys().cloned().collect();
        live_names.sort();

        let map = checkpoint::build_assignment_map(&live_names, &stored);
        for name in &map.unmatched {
            debug!("not in checkpoint, keeping initializer: {}", name);
        }

        let restored = checkpoint::restore(&mut self.vs, &path, &map)
            .with_context(|| format!("cannot warm-start from {:?}", path))?;
        info!(
            "warm start from {:?}: restored {} of {} parameters",
            path,
            restored,
            live_names.len()
        );
        self.warm_started = true;
        Ok(())
    }

    /// The head computation every mode shares: encode, gather the masked
    /// positions, project to vocabulary log-probabilities.
    fn forward_log_probs(&self, batch: &MlmBatch, training: bool) -> Tensor {
        let encoder_output = self
            .encoder
            .forward(&batch.input_ids, &batch.input_mask, training);
        let gathered = gather_indexes(&encoder_output.sequence_output, &batch.masked_lm_positions);
        self.head.forward(&gathered, &encoder_output)
    }

    /// Runs one step in the configured mode.
    pub fn step(&mut self, batch: &MlmBatch) -> Result<StepOutput> {
        self.warm_start()?;
        match self.mode {
            RunMode::Train => self.train_step(batch).map(StepOutput::Loss),
            RunMode::Eval => bail!("eval mode is not implemented"),
            RunMode::Predict => Ok(StepOutput::Predictions(self.predict(batch))),
        }
    }

    /// One optimizer update: schedule the learning rate, backprop, clip the
    /// gradients at `GRADIENT_CLIP_NORM`, apply, bump the step counter.
    /// Single-threaded, so the parameter set and the counter move as one
    /// unit; a failed step leaves both untouched.
    fn train_step(&mut self, batch: &MlmBatch) -> Result<f64> {
        let lr = polynomial_decay(
            self.config.learning_rate(),
            self.global_step,
            self.config.num_train_steps(),
        );
        self.optimizer.set_lr(lr);

        let log_probs = self.forward_log_probs(batch, true);
        let output = masked_lm_loss(&log_probs, &batch.masked_lm_ids, &batch.masked_lm_weights);

        self.optimizer.zero_grad();
        output.loss.backward();

        let variables = self.vs.trainable_variables();
        clip_global_norm(&variables, GRADIENT_CLIP_NORM)?;

        self.optimizer.step();
        self.global_step += 1;

        Ok(output.loss.double_value(&[]))
    }

    /// Arg-max token id for every prediction slot. Reads parameters, never
    /// writes them.
    fn predict(&self, batch: &MlmBatch) -> Tensor {
        let log_probs = self.forward_log_probs(batch, false);
        log_probs.argmax(-1, false)
    }

    /// Drives TRAIN steps until the configured budget is exhausted, saving a
    /// checkpoint every `save_every_steps` and pruning old ones.
    pub fn run(&mut self, dataset: &MaskedDataset) -> Result<()> {
        if self.mode != RunMode::Train {
            bail!("run() drives training; construct with RunMode::Train");
        }

        let model_dir = self.config.model_dir().to_path_buf();
        std::fs::create_dir_all(&model_dir)
            .with_context(|| format!("failed to create model dir {:?}", model_dir))?;
        checkpoint::write_config_snapshot(&self.config, &model_dir)?;

        self.warm_start()?;

        info!(
            "training for {} steps, batch size {}",
            self.config.num_train_steps(),
            self.config.batch_size()
        );

        while self.global_step < self.config.num_train_steps() {
            let batch = dataset.sample_batch(self.config.batch_size());
            let loss = self.train_step(&batch)?;

            if self.global_step % 10 == 0 || self.global_step == self.config.num_train_steps() {
                info!("step {} | loss {:.4}", self.global_step, loss);
            }
            if self.global_step % self.run_config.save_every_steps == 0 {
                self.save_checkpoint(&model_dir)?;
            }
        }

        // Make sure the final state is on disk even off-cadence.
        if self.global_step % self.run_config.save_every_steps != 0 {
            self.save_checkpoint(&model_dir)?;
        }
        Ok(())
    }

    fn save_checkpoint(&self, model_dir: &std::path::Path) -> Result<()> {
        let path = checkpoint::checkpoint_path(model_dir, self.global_step);
        checkpoint::save(&self.vs, &path)?;
        checkpoint::prune_checkpoints(model_dir, self.run_config.keep_checkpoint_max)?;
        debug!("saved checkpoint {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn tiny_config(model_dir: &str, init_checkpoint: Option<&str>) -> PretrainConfig {
        let init_line = match init_checkpoint {
            Some(path) => format!("init_checkpoint: {}\n", path),
            None => String::new(),
        };
        PretrainConfig::from_yaml(&format!(
            r#"
learning_rate: 1.0e-3
vocab_size: 17
embedding_size: 4
hidden_size: 8
max_positional_embeddings: 16
token_type_vocab_size: 0
hidden_dropout_prob: 0.0
attention_probs_dropout_prob: 0.0
num_hidden_layers: 1
num_attention_heads: 2
intermediate_size: 16
initializer_range: 0.05
data_path: data/train.data
model_dir: {}
{}batch_size: 2
num_train_steps: 4
train_type: seq2seq
max_length: 6
reverse: false
"#,
            model_dir, init_line
        ))
        .unwrap()
    }

    fn tiny_dataset() -> MaskedDataset {
        let tokens: Vec<i64> = (0..100).map(|i| i % 16).collect();
        MaskedDataset::new(tokens, 6, 2, 16, false, Device::Cpu).unwrap()
    }

    #[test]
    fn train_step_updates_parameters_and_counter() {
        let config = tiny_config("unused/", None);
        let mut trainer =
            Pretrainer::new(config, RunConfig::default(), RunMode::Train, Device::Cpu).unwrap();
        let dataset = tiny_dataset();

        let before = trainer
            .vs
            .variables()
            .get("mlm.transform.weight")
            .unwrap()
            .copy();

        let batch = dataset.sample_batch(2);
        let loss = match trainer.step(&batch).unwrap() {
            StepOutput::Loss(loss) => loss,
            StepOutput::Predictions(_) => panic!("train mode returned predictions"),
        };
        assert!(loss.is_finite());
        assert_eq!(trainer.global_step(), 1);

        let after = trainer
            .vs
            .variables()
            .get("mlm.transform.weight")
            .unwrap()
            .copy();
        let moved = (&after - &before).abs().max().double_value(&[]);
        assert!(moved > 0.0);

        trainer.step(&dataset.sample_batch(2)).unwrap();
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn eval_mode_fails_fast() {
        let config = tiny_config("unused/", None);
        let mut trainer =
            Pretrainer::new(config, RunConfig::default(), RunMode::Eval, Device::Cpu).unwrap();
        let dataset = tiny_dataset();

        let err = trainer.step(&dataset.sample_batch(2)).unwrap_err();
        assert!(err.to_string().contains("not implemented"));
        assert_eq!(trainer.global_step(), 0);
    }

    #[test]
    fn predict_returns_vocab_ids_without_mutation() {
        let config = tiny_config("unused/", None);
        let vocab_size = config.vocab_size();
        let mut trainer =
            Pretrainer::new(config, RunConfig::default(), RunMode::Predict, Device::Cpu).unwrap();
        let dataset = tiny_dataset();

        let predictions = match trainer.step(&dataset.sample_batch(2)).unwrap() {
            StepOutput::Predictions(p) => p,
            StepOutput::Loss(_) => panic!("predict mode returned a loss"),
        };
        assert_eq!(predictions.size(), vec![4]);
        assert_eq!(predictions.kind(), Kind::Int64);

        let ids: Vec<i64> = Vec::try_from(&predictions).unwrap();
        for id in ids {
            assert!((0..vocab_size).contains(&id));
        }
        assert_eq!(trainer.global_step(), 0);
    }

    #[test]
    fn missing_init_checkpoint_aborts_startup() {
        let config = tiny_config("unused/", Some("no/such/checkpoint.safetensors"));
        let mut trainer =
            Pretrainer::new(config, RunConfig::default(), RunMode::Train, Device::Cpu).unwrap();
        let dataset = tiny_dataset();

        assert!(trainer.step(&dataset.sample_batch(2)).is_err());
    }

    #[test]
    fn warm_start_restores_saved_values() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("warm.safetensors");

        let config = tiny_config("unused/", None);
        let source =
            Pretrainer::new(config.clone(), RunConfig::default(), RunMode::Train, Device::Cpu)
                .unwrap();
        checkpoint::save(&source.vs, &ckpt).unwrap();

        let warm_config = tiny_config("unused/", Some(ckpt.to_str().unwrap()));
        let mut target =
            Pretrainer::new(warm_config, RunConfig::default(), RunMode::Predict, Device::Cpu)
                .unwrap();
        target.warm_start().unwrap();

        let name = "encoder.embeddings.word.weight";
        let restored = target.vs.variables().get(name).unwrap().copy();
        let original = source.vs.variables().get(name).unwrap().copy();
        let diff = (&restored - &original).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn run_trains_to_budget_and_rotates_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().to_str().unwrap().to_string();

        let config = tiny_config(&model_dir, None);
        let run_config = RunConfig {
            save_every_steps: 2,
            keep_checkpoint_max: 1,
        };
        let mut trainer =
            Pretrainer::new(config, run_config, RunMode::Train, Device::Cpu).unwrap();
        let dataset = tiny_dataset();

        trainer.run(&dataset).unwrap();

        assert_eq!(trainer.global_step(), 4);
        assert!(dir.path().join("config.json").exists());
        assert!(!checkpoint::checkpoint_path(dir.path(), 2).exists());
        assert!(checkpoint::checkpoint_path(dir.path(), 4).exists());
    }
}
