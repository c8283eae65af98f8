use tch::Tensor;

/// Pulls the hidden vectors at the masked positions out of the encoder
/// output.
///
/// `sequence_output`: [batch, seq_len, width]; `positions`:
/// [batch, max_predictions] with every entry in [0, seq_len). Returns
/// [batch * max_predictions, width], rows ordered batch-major then
/// prediction-slot order.
///
/// Positions for padding prediction slots are gathered like any other (they
/// are conventionally 0); the caller suppresses their contribution through
/// the label weights, not here. Out-of-range positions are undefined.
pub fn gather_indexes(sequence_output: &Tensor, positions: &Tensor) -> Tensor {
    let (batch_size, seq_len, width) = sequence_output.size3().unwrap();

    let flat_offsets = (Tensor::arange(batch_size, (positions.kind(), positions.device()))
        * seq_len)
        .view([-1, 1]);
    let flat_positions = (positions + flat_offsets).view([-1]);
    let flat_sequence = sequence_output.view([batch_size * seq_len, width]);

    flat_sequence.index_select(0, &flat_positions)
}
