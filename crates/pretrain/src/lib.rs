pub mod batch;
pub mod checkpoint;
pub mod gather;
pub mod mlm;
pub mod schedule;
pub mod train;

pub use batch::{MaskedDataset, MlmBatch};
pub use train::{Pretrainer, RunConfig, RunMode, StepOutput};
