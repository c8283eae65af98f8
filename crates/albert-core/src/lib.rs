pub mod attention;
pub mod config;
pub mod encoder;
pub mod layer_norm;

pub use config::PretrainConfig;
pub use encoder::{AlbertEncoder, EncoderOutput};
