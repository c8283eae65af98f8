use albert_core::config::PretrainConfig;
use albert_core::encoder::EncoderOutput;
use albert_core::layer_norm::LayerNorm;
use tch::{nn, Kind, Tensor};

/// Result of the masked-LM objective for one batch.
pub struct MaskedLmOutput {
    /// Scalar average loss per real masked token.
    pub loss: Tensor,
    /// Negative log-likelihood per prediction slot, [N].
    pub per_example_loss: Tensor,
    /// Vocabulary log-probabilities, [N, vocab].
    pub log_probs: Tensor,
}

/// Projects gathered hidden vectors back to vocabulary log-probabilities.
///
/// Owns only the transform dense layer, its normalization, and the output
/// bias; the two projection matrices are the encoder's embedding tables,
/// reused read-only (tied weights). The factorized route hidden → embedding
/// → vocab keeps the output projection as small as the input embedding.
pub struct MaskedLmHead {
    transform: nn::Linear,
    norm: LayerNorm,
    output_bias: Tensor,
}

impl MaskedLmHead {
    pub fn new(vs: &nn::Path, config: &PretrainConfig) -> Self {
        let transform = nn::linear(
            vs / "transform",
            config.hidden_size(),
            config.hidden_size(),
            nn::LinearConfig {
                ws_init: nn::Init::Randn {
                    mean: 0.0,
                    stdev: config.initializer_range(),
                },
                ..Default::default()
            },
        );
        let norm = LayerNorm::new(&(vs / "norm"), config.hidden_size());
        let output_bias = vs.var("output_bias", &[config.vocab_size()], nn::Init::Const(0.0));

        Self {
            transform,
            norm,
            output_bias,
        }
    }

    /// gathered: [N, hidden]. Returns log-probabilities [N, vocab]; each row
    /// exponentiates and sums to 1.
    pub fn forward(&self, gathered: &Tensor, encoder_output: &EncoderOutput) -> Tensor {
        let x = gathered.apply(&self.transform).gelu("none");
        let x = self.norm.forward(&x);

        // [N, hidden] x [hidden, embedding] -> [N, embedding]
        let projected = x.matmul(&encoder_output.projection_table.tr());
        // [N, embedding] x [embedding, vocab] -> [N, vocab]
        let logits = projected.matmul(&encoder_output.embedding_table.tr());
        let logits = logits + &self.output_bias;

        logits.log_softmax(-1, Kind::Float)
    }
}

/// Average negative log-likelihood of the true tokens at the masked
/// positions.
///
/// `label_weights` is the externally supplied padding signal (1.0 real
/// token, 0.0 padding slot); it is used as given and never re-derived from
/// the label ids, so id 0 stays a legal vocabulary entry. The epsilon in the
/// denominator keeps an all-padding batch finite instead of dividing by
/// zero.
pub fn masked_lm_loss(log_probs: &Tensor, label_ids: &Tensor, label_weights: &Tensor) -> MaskedLmOutput {
    let vocab_size = log_probs.size()[1];

    let label_ids = label_ids.view([-1]);
    let label_weights = label_weights.view([-1]).to_kind(Kind::Float);

    let one_hot = label_ids.one_hot(vocab_size).to_kind(Kind::Float);
    let per_example_loss =
        -(log_probs * one_hot).sum_dim_intlist(Some(&[-1i64][..]), false, Kind::Float);

    let numerator = (&label_weights * &per_example_loss).sum(Kind::Float);
    let denominator = label_weights.sum(Kind::Float) + 1e-5;
    let loss = numerator / denominator;

    MaskedLmOutput {
        loss,
        per_example_loss,
        log_probs: log_probs.shallow_clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device, Kind, Tensor};

    fn tiny_config() -> PretrainConfig {
        PretrainConfig::from_yaml(
            r#"
learning_rate: 1.0e-3
vocab_size: 7
embedding_size: 3
hidden_size: 6
max_positional_embeddings: 16
token_type_vocab_size: 0
hidden_dropout_prob: 0.0
attention_probs_dropout_prob: 0.0
num_hidden_layers: 1
num_attention_heads: 2
intermediate_size: 12
initializer_range: 0.05
data_path: data/train.data
model_dir: models/
batch_size: 2
num_train_steps: 10
train_type: seq2seq
max_length: 4
reverse: false
"#,
        )
        .unwrap()
    }

    fn random_encoder_output(config: &PretrainConfig) -> EncoderOutput {
        EncoderOutput {
            sequence_output: Tensor::randn(
                &[2, config.max_length(), config.hidden_size()],
                (Kind::Float, Device::Cpu),
            ),
            embedding_table: Tensor::randn(
                &[config.vocab_size(), config.embedding_size()],
                (Kind::Float, Device::Cpu),
            ),
            projection_table: Tensor::randn(
                &[config.embedding_size(), config.hidden_size()],
                (Kind::Float, Device::Cpu),
            ),
        }
    }

    #[test]
    fn log_probs_rows_are_normalized() {
        let config = tiny_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let head = MaskedLmHead::new(&vs.root(), &config);
        let encoder_output = random_encoder_output(&config);

        let gathered = Tensor::randn(&[5, config.hidden_size()], (Kind::Float, Device::Cpu));
        let log_probs = head.forward(&gathered, &encoder_output);

        assert_eq!(log_probs.size(), vec![5, config.vocab_size()]);
        let row_sums = log_probs.exp().sum_dim_intlist(Some(&[-1i64][..]), false, Kind::Float);
        let sums: Vec<f32> = Vec::try_from(&row_sums).unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-4, "row sum {}", sum);
        }
    }

    #[test]
    fn loss_is_nll_of_true_token() {
        // Uniform distribution over 4 classes: loss must be ln(4).
        let log_probs = Tensor::full(&[2, 4], (0.25f64).ln(), (Kind::Float, Device::Cpu));
        let label_ids = Tensor::from_slice(&[1i64, 3]);
        let label_weights = Tensor::from_slice(&[1.0f32, 1.0]);

        let output = masked_lm_loss(&log_probs, &label_ids, &label_weights);
        let loss = output.loss.double_value(&[]);
        assert!((loss - 4.0f64.ln()).abs() < 1e-4);
    }

    #[test]
    fn padding_slots_do_not_count() {
        // Slot 1 is padding with a huge per-row loss; the average must only
        // reflect slot 0.
        let log_probs = Tensor::from_slice(&[
            (0.5f32).ln(),
            (0.5f32).ln(),
            (1e-6f32).ln(),
            (1.0f32 - 1e-6).ln(),
        ])
        .view([2, 2]);
        let label_ids = Tensor::from_slice(&[0i64, 0]);
        let label_weights = Tensor::from_slice(&[1.0f32, 0.0]);

        let output = masked_lm_loss(&log_probs, &label_ids, &label_weights);
        let loss = output.loss.double_value(&[]);
        assert!((loss - 0.5f64.ln().abs()).abs() < 1e-3);

        let per_example: Vec<f32> = Vec::try_from(&output.per_example_loss).unwrap();
        assert_eq!(per_example.len(), 2);
        assert!(per_example[1] > per_example[0]);
    }

    #[test]
    fn all_padding_batch_stays_finite() {
        let log_probs = Tensor::full(&[3, 5], (0.2f64).ln(), (Kind::Float, Device::Cpu));
        let label_ids = Tensor::from_slice(&[0i64, 1, 2]);
        let label_weights = Tensor::zeros(&[3], (Kind::Float, Device::Cpu));

        let output = masked_lm_loss(&log_probs, &label_ids, &label_weights);
        let loss = output.loss.double_value(&[]);
        assert!(loss.is_finite());
    }

    #[test]
    fn zero_id_is_a_real_label() {
        // Label id 0 with weight 1.0 must contribute to the average; the
        // weighting signal comes from the weights tensor alone.
        let log_probs = Tensor::full(&[1, 4], (0.25f64).ln(), (Kind::Float, Device::Cpu));
        let label_ids = Tensor::from_slice(&[0i64]);
        let label_weights = Tensor::from_slice(&[1.0f32]);

        let output = masked_lm_loss(&log_probs, &label_ids, &label_weights);
        let loss = output.loss.double_value(&[]);
        assert!((loss - 4.0f64.ln()).abs() < 1e-4);
    }
}
