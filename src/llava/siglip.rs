//! SigLIP vision encoder, trimmed to what the LLaVA projector consumes: the
//! patch hidden states of a chosen encoder layer.

use super::config::VisionConfig;
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};

struct VisionEmbeddings {
    patch_embedding: Conv2d,
    position_embedding: Embedding,
    position_ids: Tensor,
}

impl VisionEmbeddings {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let patch_embedding = candle_nn::conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embedding"),
        )?;
        let num_positions = cfg.num_patches();
        let position_embedding =
            candle_nn::embedding(num_positions, cfg.hidden_size, vb.pp("position_embedding"))?;
        let position_ids = Tensor::arange(0u32, num_positions as u32, vb.device())?;
        Ok(Self {
            patch_embedding,
            position_embedding,
            position_ids,
        })
    }
}

impl Module for VisionEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        // (b, c, h, w) -> (b, num_patches, hidden)
        let patches = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let positions = self.position_embedding.forward(&self.position_ids)?;
        patches.broadcast_add(&positions)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let head_dim = h / cfg.num_attention_heads;
        Ok(Self {
            q_proj: candle_nn::linear(h, h, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(h, h, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(h, h, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        xs.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let in_dtype = xs.dtype();
        let (b, t, h) = xs.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(xs)?)?.to_dtype(DType::F32)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?)?.to_dtype(DType::F32)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?.to_dtype(DType::F32)?;

        let attn = (q.matmul(&k.t()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .to_dtype(in_dtype)?
            .transpose(1, 2)?
            .reshape((b, t, h))?;
        self.out_proj.forward(&out)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
    act: Activation,
}

impl Mlp {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
            act: cfg.hidden_act,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.apply(&self.act)?.apply(&self.fc2)
    }
}

struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    mlp: Mlp,
}

impl EncoderLayer {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            layer_norm1: candle_nn::layer_norm(h, cfg.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            layer_norm2: candle_nn::layer_norm(h, cfg.layer_norm_eps, vb.pp("layer_norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }
}

impl Module for EncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = (residual + xs.apply(&self.layer_norm1)?.apply(&self.self_attn)?)?;
        let residual = &xs;
        residual + xs.apply(&self.layer_norm2)?.apply(&self.mlp)?
    }
}

pub struct SiglipVisionTower {
    embeddings: VisionEmbeddings,
    layers: Vec<EncoderLayer>,
}

impl SiglipVisionTower {
    /// Loads the tower from `vision_tower.vision_model`. The post layer norm and
    /// pooling head are not needed for feature extraction and are skipped.
    pub fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = VisionEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_layers = vb.pp("encoder").pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::new(cfg, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    /// Returns the hidden states after `feature_layer`, counting the embeddings
    /// as state 0. Negative values index from the last layer, -1 being the
    /// output of the final encoder layer.
    pub fn hidden_states(&self, pixel_values: &Tensor, feature_layer: i32) -> Result<Tensor> {
        let depth = resolve_layer(feature_layer, self.layers.len())?;
        let mut xs = self.embeddings.forward(pixel_values)?;
        for layer in &self.layers[..depth] {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

/// Maps a possibly negative hidden state index onto the number of encoder
/// layers to run.
fn resolve_layer(feature_layer: i32, num_layers: usize) -> Result<usize> {
    let num_states = num_layers as i64 + 1;
    let index = if feature_layer < 0 {
        num_states + feature_layer as i64
    } else {
        feature_layer as i64
    };
    if !(0..num_states).contains(&index) {
        candle_core::bail!(
            "vision feature layer {feature_layer} out of range for {num_layers} layers"
        )
    }
    Ok(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_layers_count_from_the_end() {
        assert_eq!(resolve_layer(-1, 26).unwrap(), 26);
        assert_eq!(resolve_layer(-2, 26).unwrap(), 25);
        assert_eq!(resolve_layer(0, 26).unwrap(), 0);
        assert_eq!(resolve_layer(26, 26).unwrap(), 26);
    }

    #[test]
    fn out_of_range_layers_are_rejected() {
        assert!(resolve_layer(27, 26).is_err());
        assert!(resolve_layer(-28, 26).is_err());
    }
}
