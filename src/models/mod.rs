//! Model architectures
//!
//! This module contains the encoder network construction.

pub mod encoder;

pub use encoder::{flattened_features, Encoder, LayerSpec};
