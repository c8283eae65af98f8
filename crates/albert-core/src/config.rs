use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Pretraining hyperparameters, fixed at construction.
///
/// Fields are private on purpose: the config is validated once by
/// [`PretrainConfig::from_yaml`] / [`PretrainConfig::from_file`] and is
/// read-only afterwards. Unknown keys in the source document are rejected
/// rather than ignored, so a typo cannot silently introduce a new field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PretrainConfig {
    /// Base learning rate, decayed linearly to zero over `num_train_steps`.
    learning_rate: f64,
    /// Size of the vocabulary.
    vocab_size: i64,
    /// Width of the factorized token embeddings.
    embedding_size: i64,
    /// Width of the encoder hidden states.
    hidden_size: i64,
    /// Maximum sequence length the positional table covers.
    max_positional_embeddings: i64,
    /// Number of token-type (segment) ids; 0 disables the segment table.
    token_type_vocab_size: i64,
    /// Dropout on hidden states and embeddings.
    hidden_dropout_prob: f64,
    /// Dropout on attention probabilities.
    attention_probs_dropout_prob: f64,
    /// Number of encoder layer applications (parameters are shared).
    num_hidden_layers: i64,
    /// Number of attention heads.
    num_attention_heads: i64,
    /// Width of the feed-forward inner layer.
    intermediate_size: i64,
    /// Stddev of the normal initializer for newly created weights.
    initializer_range: f64,
    /// Token-id training data file.
    data_path: PathBuf,
    /// Directory receiving periodic checkpoints.
    model_dir: PathBuf,
    /// Optional checkpoint to warm-start from; absent means cold start.
    #[serde(default)]
    init_checkpoint: Option<PathBuf>,
    /// Sequences per training step.
    batch_size: i64,
    /// Total optimizer steps to run.
    num_train_steps: i64,
    /// Training task selector, e.g. "seq2seq".
    train_type: String,
    /// Sequence length sampled per batch row.
    max_length: i64,
    /// Reverse each sampled token window before masking.
    reverse: bool,
}

impl PretrainConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("embedding_size", self.embedding_size),
            ("hidden_size", self.hidden_size),
            ("max_positional_embeddings", self.max_positional_embeddings),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("intermediate_size", self.intermediate_size),
            ("batch_size", self.batch_size),
            ("num_train_steps", self.num_train_steps),
            ("max_length", self.max_length),
        ] {
            if value <= 0 {
                bail!("{} must be positive, got {}", name, value);
            }
        }
        if self.token_type_vocab_size < 0 {
            bail!(
                "token_type_vocab_size must be non-negative, got {}",
                self.token_type_vocab_size
            );
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        for (name, p) in [
            ("hidden_dropout_prob", self.hidden_dropout_prob),
            ("attention_probs_dropout_prob", self.attention_probs_dropout_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("{} must be in [0, 1], got {}", name, p);
            }
        }
        if self.initializer_range < 0.0 || !self.initializer_range.is_finite() {
            bail!(
                "initializer_range must be non-negative, got {}",
                self.initializer_range
            );
        }
        if self.max_length > self.max_positional_embeddings {
            bail!(
                "max_length {} exceeds max_positional_embeddings {}",
                self.max_length,
                self.max_positional_embeddings
            );
        }
        if self.train_type.is_empty() {
            bail!("train_type must not be empty");
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    pub fn embedding_size(&self) -> i64 {
        self.embedding_size
    }

    pub fn hidden_size(&self) -> i64 {
        self.hidden_size
    }

    pub fn max_positional_embeddings(&self) -> i64 {
        self.max_positional_embeddings
    }

    pub fn token_type_vocab_size(&self) -> i64 {
        self.token_type_vocab_size
    }

    pub fn hidden_dropout_prob(&self) -> f64 {
        self.hidden_dropout_prob
    }

    pub fn attention_probs_dropout_prob(&self) -> f64 {
        self.attention_probs_dropout_prob
    }

    pub fn num_hidden_layers(&self) -> i64 {
        self.num_hidden_layers
    }

    pub fn num_attention_heads(&self) -> i64 {
        self.num_attention_heads
    }

    pub fn intermediate_size(&self) -> i64 {
        self.intermediate_size
    }

    pub fn initializer_range(&self) -> f64 {
        self.initializer_range
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn init_checkpoint(&self) -> Option<&Path> {
        self.init_checkpoint.as_deref()
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    pub fn num_train_steps(&self) -> i64 {
        self.num_train_steps
    }

    pub fn train_type(&self) -> &str {
        &self.train_type
    }

    pub fn max_length(&self) -> i64 {
        self.max_length
    }

    pub fn reverse(&self) -> bool {
        self.reverse
    }

    pub fn head_size(&self) -> i64 {
        self.hidden_size / self.num_attention_heads
    }
}
