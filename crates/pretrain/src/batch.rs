use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use tch::{Device, Kind, Tensor};

/// One pretraining batch, shaped per the data-pipeline contract.
pub struct MlmBatch {
    /// [batch, seq_len] token ids, masked positions already overwritten.
    pub input_ids: Tensor,
    /// [batch, seq_len], 1 for real tokens.
    pub input_mask: Tensor,
    /// [batch, max_predictions] positions into the sequence; 0 on padding
    /// slots (still a valid gather index, suppressed by the weights).
    pub masked_lm_positions: Tensor,
    /// [batch, max_predictions] true token ids at the masked positions.
    pub masked_lm_ids: Tensor,
    /// [batch, max_predictions] 1.0 for a real masked token, 0.0 padding.
    pub masked_lm_weights: Tensor,
}

/// Samples masked-LM batches from a flat token-id stream.
pub struct MaskedDataset {
    tokens: Vec<i64>,
    seq_len: usize,
    max_predictions: usize,
    mask_token_id: i64,
    reverse: bool,
    device: Device,
}

impl MaskedDataset {
    pub fn new(
        tokens: Vec<i64>,
        seq_len: usize,
        max_predictions: usize,
        mask_token_id: i64,
        reverse: bool,
        device: Device,
    ) -> Result<Self> {
        if tokens.len() <= seq_len {
            bail!(
                "need more than {} tokens for sequence length {}, got {}",
                seq_len,
                seq_len,
                tokens.len()
            );
        }
        if max_predictions == 0 || max_predictions > seq_len {
            bail!(
                "max_predictions must be in 1..={}, got {}",
                seq_len,
                max_predictions
            );
        }
        Ok(Self {
            tokens,
            seq_len,
            max_predictions,
            mask_token_id,
            reverse,
            device,
        })
    }

    /// Reads whitespace-separated token ids.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        seq_len: usize,
        max_predictions: usize,
        mask_token_id: i64,
        reverse: bool,
        device: Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read training data {:?}", path))?;
        let tokens = text
            .split_whitespace()
            .map(|field| {
                field
                    .parse::<i64>()
                    .with_context(|| format!("invalid token id {:?} in {:?}", field, path))
            })
            .collect::<Result<Vec<i64>>>()?;
        Self::new(tokens, seq_len, max_predictions, mask_token_id, reverse, device)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn sample_batch(&self, batch_size: i64) -> MlmBatch {
        let mut rng = thread_rng();
        let batch_size = batch_size as usize;
        let max_start = self.tokens.len() - self.seq_len;

        let mut input_ids = Vec::with_capacity(batch_size * self.seq_len);
        let mut positions = Vec::with_capacity(batch_size * self.max_predictions);
        let mut label_ids = Vec::with_capacity(batch_size * self.max_predictions);
        let mut weights = Vec::with_capacity(batch_size * self.max_predictions);

        for _ in 0..batch_size {
            let start = rng.gen_range(0..max_start);
            let mut window: Vec<i64> = self.tokens[start..start + self.seq_len].to_vec();
            if self.reverse {
                window.reverse();
            }

            let num_masked = rng.gen_range(1..=self.max_predictions);
            let mut slots: Vec<usize> = (0..self.seq_len).collect();
            slots.shuffle(&mut rng);
            let mut chosen = slots[..num_masked].to_vec();
            chosen.sort_unstable();

            for slot in 0..self.max_predictions {
                if slot < num_masked {
                    let position = chosen[slot];
                    positions.push(position as i64);
                    label_ids.push(window[position]);
                    weights.push(1.0f32);
                    window[position] = self.mask_token_id;
                } else {
                    positions.push(0);
                    label_ids.push(0);
                    weights.push(0.0);
                }
            }
            input_ids.extend_from_slice(&window);
        }

        let shape_seq = [batch_size as i64, self.seq_len as i64];
        let shape_pred = [batch_size as i64, self.max_predictions as i64];

        MlmBatch {
            input_ids: Tensor::from_slice(&input_ids).view(shape_seq).to(self.device),
            input_mask: Tensor::ones(&shape_seq, (Kind::Int64, self.device)),
            masked_lm_positions: Tensor::from_slice(&positions)
                .view(shape_pred)
                .to(self.device),
            masked_lm_ids: Tensor::from_slice(&label_ids).view(shape_pred).to(self.device),
            masked_lm_weights: Tensor::from_slice(&weights).view(shape_pred).to(self.device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_vec_i64(t: &Tensor) -> Vec<i64> {
        Vec::try_from(&t.view([-1])).unwrap()
    }

    fn to_vec_f32(t: &Tensor) -> Vec<f32> {
        Vec::try_from(&t.view([-1])).unwrap()
    }

    #[test]
    fn batch_tensors_have_contract_shapes() {
        let tokens: Vec<i64> = (1..200).collect();
        let dataset = MaskedDataset::new(tokens, 8, 3, 999, false, Device::Cpu).unwrap();

        let batch = dataset.sample_batch(4);
        assert_eq!(batch.input_ids.size(), vec![4, 8]);
        assert_eq!(batch.input_mask.size(), vec![4, 8]);
        assert_eq!(batch.masked_lm_positions.size(), vec![4, 3]);
        assert_eq!(batch.masked_lm_ids.size(), vec![4, 3]);
        assert_eq!(batch.masked_lm_weights.size(), vec![4, 3]);
    }

    #[test]
    fn real_slots_point_at_mask_tokens() {
        let tokens: Vec<i64> = (1..200).collect();
        let dataset = MaskedDataset::new(tokens, 8, 3, 999, false, Device::Cpu).unwrap();

        let batch = dataset.sample_batch(4);
        let ids = to_vec_i64(&batch.input_ids);
        let positions = to_vec_i64(&batch.masked_lm_positions);
        let labels = to_vec_i64(&batch.masked_lm_ids);
        let weights = to_vec_f32(&batch.masked_lm_weights);

        for row in 0..4usize {
            for slot in 0..3usize {
                let flat = row * 3 + slot;
                let position = positions[flat] as usize;
                assert!(position < 8);
                if weights[flat] == 1.0 {
                    assert_eq!(ids[row * 8 + position], 999);
                    assert_ne!(labels[flat], 999);
                } else {
                    assert_eq!(position, 0);
                    assert_eq!(labels[flat], 0);
                }
            }
        }
    }

    #[test]
    fn reverse_flips_the_sampled_window() {
        let tokens: Vec<i64> = (0..100).collect();
        let dataset = MaskedDataset::new(tokens, 6, 1, 9999, true, Device::Cpu).unwrap();

        let batch = dataset.sample_batch(1);
        let mut ids = to_vec_i64(&batch.input_ids);
        let positions = to_vec_i64(&batch.masked_lm_positions);
        let labels = to_vec_i64(&batch.masked_lm_ids);

        // Undo the single mask so the raw window is visible again.
        ids[positions[0] as usize] = labels[0];
        for pair in ids.windows(2) {
            assert_eq!(pair[0] - 1, pair[1]);
        }
    }

    #[test]
    fn rejects_streams_shorter_than_a_window() {
        let result = MaskedDataset::new(vec![1, 2, 3], 8, 2, 99, false, Device::Cpu);
        assert!(result.is_err());
    }
}
