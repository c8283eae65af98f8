use tch::{nn, Kind, Tensor};

use crate::attention::SelfAttention;
use crate::config::PretrainConfig;
use crate::layer_norm::LayerNorm;

/// What the encoder hands to the pretraining objective.
///
/// `embedding_table` ([vocab, embedding]) and `projection_table`
/// ([embedding, hidden]) are the encoder's own variables; the masked-LM head
/// reuses them for its tied output projection and must treat them read-only.
pub struct EncoderOutput {
    /// Per-token hidden states, [batch, seq_len, hidden].
    pub sequence_output: Tensor,
    /// Factorized token embeddings, [vocab, embedding].
    pub embedding_table: Tensor,
    /// Embedding-to-hidden bridge, [embedding, hidden].
    pub projection_table: Tensor,
}

/// Feed-forward block.
struct FeedForward {
    intermediate: nn::Linear,
    output: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    fn new(vs: &nn::Path, config: &PretrainConfig) -> Self {
        let linear_config = nn::LinearConfig {
            ws_init: nn::Init::Randn {
                mean: 0.0,
                stdev: config.initializer_range(),
            },
            ..Default::default()
        };
        let intermediate = nn::linear(
            vs / "intermediate",
            config.hidden_size(),
            config.intermediate_size(),
            linear_config,
        );
        let output = nn::linear(
            vs / "output",
            config.intermediate_size(),
            config.hidden_size(),
            linear_config,
        );
        Self {
            intermediate,
            output,
            dropout: config.hidden_dropout_prob(),
        }
    }

    fn forward(&self, x: &Tensor, training: bool) -> Tensor {
        x.apply(&self.intermediate)
            .gelu("none")
            .apply(&self.output)
            .dropout(self.dropout, training)
    }
}

/// One encoder layer: attention and feed-forward with residuals.
struct Layer {
    ln_1: LayerNorm,
    attention: SelfAttention,
    ln_2: LayerNorm,
    ffn: FeedForward,
}

impl Layer {
    fn new(vs: &nn::Path, config: &PretrainConfig) -> Self {
        Self {
            ln_1: LayerNorm::new(&(vs / "ln_1"), config.hidden_size()),
            attention: SelfAttention::new(&(vs / "attention"), config),
            ln_2: LayerNorm::new(&(vs / "ln_2"), config.hidden_size()),
            ffn: FeedForward::new(&(vs / "ffn"), config),
        }
    }

    fn forward(&self, x: &Tensor, attention_bias: &Tensor, training: bool) -> Tensor {
        let x = x + self.attention.forward(&self.ln_1.forward(x), attention_bias, training);
        &x + self.ffn.forward(&self.ln_2.forward(&x), training)
    }
}

/// ALBERT-style sequence encoder.
///
/// Token embeddings are factorized: the [vocab, embedding] table is projected
/// into hidden space by a separate [embedding, hidden] matrix, so the
/// vocabulary-sized table stays small. A single transformer layer is applied
/// `num_hidden_layers` times (cross-layer parameter sharing).
pub struct AlbertEncoder {
    word_embeddings: nn::Embedding,
    projection: Tensor,
    position_embeddings: Tensor,
    token_type_embeddings: Option<Tensor>,
    embedding_norm: LayerNorm,
    shared_layer: Layer,
    final_norm: LayerNorm,
    num_layers: i64,
    dropout: f64,
}

impl AlbertEncoder {
    pub fn new(vs: &nn::Path, config: &PretrainConfig) -> Self {
        let init = nn::Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range(),
        };
        let embeddings = vs / "embeddings";

        let word_embeddings = nn::embedding(
            &embeddings / "word",
            config.vocab_size(),
            config.embedding_size(),
            nn::EmbeddingConfig {
                ws_init: init,
                ..Default::default()
            },
        );
        let projection = embeddings.var(
            "projection",
            &[config.embedding_size(), config.hidden_size()],
            init,
        );
        let position_embeddings = embeddings.var(
            "position",
            &[config.max_positional_embeddings(), config.hidden_size()],
            init,
        );
        // Segment table only exists when the task actually uses segments.
        let token_type_embeddings = if config.token_type_vocab_size() > 0 {
            Some(embeddings.var(
                "token_type",
                &[config.token_type_vocab_size(), config.hidden_size()],
                init,
            ))
        } else {
            None
        };
        let embedding_norm = LayerNorm::new(&(&embeddings / "norm"), config.hidden_size());

        let shared_layer = Layer::new(&(vs / "layer_shared"), config);
        let final_norm = LayerNorm::new(&(vs / "final_norm"), config.hidden_size());

        Self {
            word_embeddings,
            projection,
            position_embeddings,
            token_type_embeddings,
            embedding_norm,
            shared_layer,
            final_norm,
            num_layers: config.num_hidden_layers(),
            dropout: config.hidden_dropout_prob(),
        }
    }

    /// input_ids, input_mask: [batch, seq_len] with mask 1 for real tokens.
    pub fn forward(&self, input_ids: &Tensor, input_mask: &Tensor, training: bool) -> EncoderOutput {
        let (_b, t) = input_ids.size2().unwrap();

        // 0 where attention is allowed, -10000 on padding slots.
        let mask = input_mask.to_kind(Kind::Float);
        let attention_bias = ((mask - 1.0) * 10000.0).unsqueeze(1).unsqueeze(1);

        let embedded = input_ids.apply(&self.word_embeddings);
        let mut x = embedded.matmul(&self.projection);
        x = x + self.position_embeddings.narrow(0, 0, t).unsqueeze(0);
        if let Some(token_type) = &self.token_type_embeddings {
            // Single-segment input: every token carries type id 0.
            x = x + token_type.narrow(0, 0, 1).unsqueeze(0);
        }
        let mut x = self
            .embedding_norm
            .forward(&x)
            .dropout(self.dropout, training);

        for _ in 0..self.num_layers {
            x = self.shared_layer.forward(&x, &attention_bias, training);
        }
        let sequence_output = self.final_norm.forward(&x);

        EncoderOutput {
            sequence_output,
            embedding_table: self.word_embeddings.ws.shallow_clone(),
            projection_table: self.projection.shallow_clone(),
        }
    }
}
