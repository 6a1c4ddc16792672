//! Conditional image-to-latent encoder
//!
//! Maps a face image, jointly with a side-channel attribute vector, onto the
//! latent code a paired generator is assumed to invert. The attribute vector
//! is broadcast over the image plane and concatenated along the channel axis,
//! then pushed through a stack of stride-2 conv blocks and a fully-connected
//! head.
//!
//! The architecture is declared as a flat list of [`LayerSpec`] entries and
//! materialized by a generic sequential builder, so the shape arithmetic
//! lives in exactly one place.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear,
    ModuleT, VarBuilder,
};

/// Kernel size / stride / padding of every conv block: 5x5, stride 2,
/// padding 2, halving each spatial dimension.
const CONV_KERNEL: usize = 5;
const CONV_STRIDE: usize = 2;
const CONV_PADDING: usize = 2;

/// Declarative description of one encoder stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec {
    /// 5x5/2 convolution, per-channel batch norm, ReLU.
    Conv {
        in_channels: usize,
        out_channels: usize,
    },
    /// Collapse `[B, C, H, W]` activations to `[B, C*H*W]`.
    Flatten,
    /// Linear layer with batch norm and ReLU.
    Hidden {
        in_features: usize,
        out_features: usize,
    },
    /// Final linear projection, no activation (regression output).
    Project {
        in_features: usize,
        out_features: usize,
    },
}

enum Layer {
    Conv { conv: Conv2d, norm: BatchNorm },
    Flatten,
    Hidden { linear: Linear, norm: BatchNorm },
    Project { linear: Linear },
}

impl Layer {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Layer::Conv { conv, norm } => {
                let x = conv.forward(x)?;
                let x = norm.forward_t(&x, train)?;
                x.relu()
            }
            Layer::Flatten => x.flatten_from(1),
            Layer::Hidden { linear, norm } => {
                let x = linear.forward(x)?;
                let x = norm.forward_t(&x, train)?;
                x.relu()
            }
            Layer::Project { linear } => linear.forward(x),
        }
    }
}

/// Builds one stage of the sequential graph under a per-stage weight prefix.
fn build_layer(spec: &LayerSpec, index: usize, vb: &VarBuilder) -> Result<Layer> {
    let conv_config = Conv2dConfig {
        padding: CONV_PADDING,
        stride: CONV_STRIDE,
        ..Default::default()
    };
    match *spec {
        LayerSpec::Conv {
            in_channels,
            out_channels,
        } => Ok(Layer::Conv {
            conv: conv2d(
                in_channels,
                out_channels,
                CONV_KERNEL,
                conv_config,
                vb.pp(format!("conv{index}")),
            )?,
            norm: batch_norm(
                out_channels,
                BatchNormConfig::default(),
                vb.pp(format!("norm{index}")),
            )?,
        }),
        LayerSpec::Flatten => Ok(Layer::Flatten),
        LayerSpec::Hidden {
            in_features,
            out_features,
        } => Ok(Layer::Hidden {
            linear: linear(in_features, out_features, vb.pp(format!("fc{index}")))?,
            norm: batch_norm(
                out_features,
                BatchNormConfig::default(),
                vb.pp(format!("fc_norm{index}")),
            )?,
        }),
        LayerSpec::Project {
            in_features,
            out_features,
        } => Ok(Layer::Project {
            linear: linear(in_features, out_features, vb.pp(format!("out{index}")))?,
        }),
    }
}

fn build_sequential(specs: &[LayerSpec], vb: &VarBuilder) -> Result<Vec<Layer>> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| build_layer(spec, index, vb))
        .collect()
}

/// Flattened feature count after the conv stack:
/// `base_filters * 2^(L-1) * (H / 2^L) * (W / 2^L)`.
pub fn flattened_features(
    height: usize,
    width: usize,
    base_filters: usize,
    conv_layers: usize,
) -> usize {
    let final_filters = base_filters << (conv_layers - 1);
    final_filters * (height >> conv_layers) * (width >> conv_layers)
}

/// Layer-spec list for the full encoder: conv stack, flatten, hidden linear
/// of the flattened width, projection to the latent dimensionality.
fn encoder_specs(
    input_depth: usize,
    base_filters: usize,
    conv_layers: usize,
    features: usize,
    output_size: usize,
) -> Vec<LayerSpec> {
    let mut specs = Vec::with_capacity(conv_layers + 3);
    let mut in_channels = input_depth;
    let mut out_channels = base_filters;
    for _ in 0..conv_layers {
        specs.push(LayerSpec::Conv {
            in_channels,
            out_channels,
        });
        in_channels = out_channels;
        out_channels *= 2;
    }
    specs.push(LayerSpec::Flatten);
    specs.push(LayerSpec::Hidden {
        in_features: features,
        out_features: features,
    });
    specs.push(LayerSpec::Project {
        in_features: features,
        out_features: output_size,
    });
    specs
}

pub struct Encoder {
    layers: Vec<Layer>,
    attribute_size: usize,
    features: usize,
}

impl Encoder {
    /// Builds the computation graph for images of `(channels, height, width)`
    /// conditioned on attribute vectors of `attribute_size`, predicting
    /// latent vectors of `output_size`. Weights come from `vb`'s default
    /// initialization scheme.
    pub fn new(
        image_shape: (usize, usize, usize),
        attribute_size: usize,
        base_filters: usize,
        conv_layers: usize,
        output_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (channels, height, width) = image_shape;
        if conv_layers == 0 {
            bail!("encoder needs at least one conv layer");
        }
        if base_filters == 0 {
            bail!("encoder needs a non-zero base filter count");
        }
        let stride_total = 1usize << conv_layers;
        if height % stride_total != 0 || width % stride_total != 0 {
            bail!(
                "image size {height}x{width} is not divisible by 2^{conv_layers}; \
                 the stride-2 conv stack would truncate spatial dimensions"
            );
        }
        let features = flattened_features(height, width, base_filters, conv_layers);
        let specs = encoder_specs(
            channels + attribute_size,
            base_filters,
            conv_layers,
            features,
            output_size,
        );
        let layers = build_sequential(&specs, &vb)?;
        Ok(Self {
            layers,
            attribute_size,
            features,
        })
    }

    /// Flattened pre-head feature length.
    pub fn features(&self) -> usize {
        self.features
    }

    /// Forward pass over a batch of images `[B, C, H, W]` and attribute
    /// vectors `[B, Y]`. The attributes are replicated along both spatial
    /// axes and concatenated with the image on the channel axis. `train`
    /// selects batch-statistics vs running-statistics normalization.
    pub fn forward_t(&self, images: &Tensor, attributes: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, _channels, height, width) = images.dims4()?;
        let plane = attributes
            .unsqueeze(2)?
            .unsqueeze(3)?
            .broadcast_as((batch, self.attribute_size, height, width))?;
        let mut x = Tensor::cat(&[images, &plane.contiguous()?], 1)?;
        for layer in &self.layers {
            x = layer.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn encoder(conv_layers: usize) -> (Encoder, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = Encoder::new((3, 32, 32), 4, 8, conv_layers, 16, vb).unwrap();
        (encoder, varmap)
    }

    #[test]
    fn flattened_feature_length_matches_the_conv_stack() {
        assert_eq!(flattened_features(32, 32, 8, 3), 8 * 4 * 4 * 4);
        assert_eq!(flattened_features(64, 64, 16, 4), 128 * 4 * 4);
        let (encoder, _varmap) = encoder(3);
        assert_eq!(encoder.features(), 32 * 4 * 4);
    }

    #[test]
    fn forward_yields_batch_by_output_size() {
        let device = Device::Cpu;
        let (encoder, _varmap) = encoder(2);
        let images = Tensor::rand(-1f32, 1f32, (5, 3, 32, 32), &device).unwrap();
        let attributes = Tensor::rand(0f32, 1f32, (5, 4), &device).unwrap();
        let out = encoder.forward_t(&images, &attributes, false).unwrap();
        assert_eq!(out.dims(), &[5, 16]);
        let out = encoder.forward_t(&images, &attributes, true).unwrap();
        assert_eq!(out.dims(), &[5, 16]);
    }

    #[test]
    fn indivisible_spatial_size_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Encoder::new((3, 30, 32), 4, 8, 3, 16, vb).is_err());
    }

    #[test]
    fn mse_is_zero_only_at_the_target() {
        let device = Device::Cpu;
        let prediction = Tensor::rand(-1f32, 1f32, (4, 16), &device).unwrap();
        let zero = candle_nn::loss::mse(&prediction, &prediction)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(zero, 0.0);
        let shifted = (&prediction + 0.5).unwrap();
        let off = candle_nn::loss::mse(&prediction, &shifted)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(off > 0.0);
    }
}
