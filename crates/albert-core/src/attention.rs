use tch::{nn, Kind, Tensor};

use crate::config::PretrainConfig;

/// Bidirectional multi-head self-attention.
///
/// Unlike a decoder block there is no causal mask: every token may attend to
/// every non-padding token, which is what the masked-LM objective needs. The
/// padding mask arrives as an additive bias computed once per batch by the
/// encoder (0 for real tokens, a large negative value for padding).
pub struct SelfAttention {
    qkv: nn::Linear,
    output: nn::Linear,
    n_head: i64,
    dropout: f64,
}

impl SelfAttention {
    pub fn new(vs: &nn::Path, config: &PretrainConfig) -> Self {
        let hidden = config.hidden_size();
        let linear_config = nn::LinearConfig {
            ws_init: nn::Init::Randn {
                mean: 0.0,
                stdev: config.initializer_range(),
            },
            ..Default::default()
        };

        let qkv = nn::linear(vs / "qkv", hidden, 3 * hidden, linear_config);
        let output = nn::linear(vs / "output", hidden, hidden, linear_config);

        Self {
            qkv,
            output,
            n_head: config.num_attention_heads(),
            dropout: config.attention_probs_dropout_prob(),
        }
    }

    /// x: [batch, seq_len, hidden], attention_bias: [batch, 1, 1, seq_len]
    pub fn forward(&self, x: &Tensor, attention_bias: &Tensor, training: bool) -> Tensor {
        let (b, t, c) = x.size3().unwrap();
        let head_size = c / self.n_head;

        let qkv = x.apply(&self.qkv);
        let chunks = qkv.chunk(3, -1);
        let (q, k, v) = (&chunks[0], &chunks[1], &chunks[2]);

        let q = q.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let k = k.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let v = v.view([b, t, self.n_head, head_size]).transpose(1, 2);

        let scores = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_size as f64).sqrt());
        let scores = scores + attention_bias;

        let probs = scores.softmax(-1, Kind::Float);
        let probs = probs.dropout(self.dropout, training);

        let context = probs.matmul(&v);
        let context = context.transpose(1, 2).contiguous().view([b, t, c]);
        context.apply(&self.output)
    }
}
