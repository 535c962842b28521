//! Model and processor configuration, as published next to the weights.
//!
//! `config.json` only lists the values that differ from the library defaults,
//! so every field falls back to the value of `llava-interleave-qwen-0.5b`.

use candle_nn::Activation;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LlavaConfig {
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
    #[serde(default = "default_projector_hidden_act")]
    pub projector_hidden_act: Activation,
    #[serde(default = "default_vision_feature_layer")]
    pub vision_feature_layer: i32,
    #[serde(default = "default_vision_feature_select_strategy")]
    pub vision_feature_select_strategy: String,
    #[serde(default)]
    pub text_config: TextConfig,
    #[serde(default)]
    pub vision_config: VisionConfig,
}

fn default_image_token_index() -> u32 {
    151646
}

fn default_projector_hidden_act() -> Activation {
    Activation::Gelu
}

fn default_vision_feature_layer() -> i32 {
    -1
}

fn default_vision_feature_select_strategy() -> String {
    "full".to_string()
}

/// Qwen2 language model.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub max_position_embeddings: usize,
    pub rope_theta: f64,
    pub rms_norm_eps: f64,
    pub hidden_act: Activation,
    pub tie_word_embeddings: bool,
    pub eos_token_id: Option<u32>,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 152000,
            hidden_size: 1024,
            intermediate_size: 2816,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            num_key_value_heads: 16,
            max_position_embeddings: 32768,
            rope_theta: 1_000_000.0,
            rms_norm_eps: 1e-6,
            hidden_act: Activation::Silu,
            tie_word_embeddings: true,
            eos_token_id: Some(151645),
        }
    }
}

impl TextConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// SigLIP vision tower.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: Activation,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 1152,
            intermediate_size: 4304,
            num_hidden_layers: 26,
            num_attention_heads: 16,
            num_channels: 3,
            image_size: 384,
            patch_size: 14,
            layer_norm_eps: 1e-6,
            hidden_act: Activation::GeluPytorchTanh,
        }
    }
}

impl VisionConfig {
    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

/// `preprocessor_config.json` of the image processor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub size: ImageSize,
    pub do_resize: bool,
    pub resample: u32,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            size: ImageSize {
                height: 384,
                width: 384,
            },
            do_resize: true,
            resample: 3,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

/// `generation_config.json`, when the repository ships one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Multiple(ids) => ids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_config_falls_back_to_defaults() {
        let config: LlavaConfig = serde_json::from_str(
            r#"{
                "architectures": ["LlavaForConditionalGeneration"],
                "image_token_index": 151646,
                "text_config": { "model_type": "qwen2", "hidden_size": 1024, "eos_token_id": 151645 },
                "vision_config": { "model_type": "siglip_vision_model", "image_size": 384 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.image_token_index, 151646);
        assert_eq!(config.vision_feature_layer, -1);
        assert_eq!(config.vision_feature_select_strategy, "full");
        assert_eq!(config.projector_hidden_act, Activation::Gelu);
        assert_eq!(config.text_config.head_dim(), 64);
        assert_eq!(config.text_config.eos_token_id, Some(151645));
        assert_eq!(config.vision_config.num_patches(), 729);
        assert_eq!(config.vision_config.hidden_act, Activation::GeluPytorchTanh);
    }

    #[test]
    fn preprocessor_config_parses_siglip_processor() {
        let config: PreprocessorConfig = serde_json::from_str(
            r#"{
                "do_normalize": true,
                "do_rescale": true,
                "do_resize": true,
                "image_mean": [0.5, 0.5, 0.5],
                "image_processor_type": "SiglipImageProcessor",
                "image_std": [0.5, 0.5, 0.5],
                "processor_class": "LlavaProcessor",
                "resample": 3,
                "rescale_factor": 0.00392156862745098,
                "size": { "height": 384, "width": 384 }
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.size,
            ImageSize {
                height: 384,
                width: 384
            }
        );
        assert_eq!(config.resample, 3);
    }

    #[test]
    fn eos_token_id_accepts_one_or_many() {
        let single: GenerationConfig = serde_json::from_str(r#"{"eos_token_id": 7}"#).unwrap();
        let many: GenerationConfig =
            serde_json::from_str(r#"{"eos_token_id": [7, 9], "do_sample": false}"#).unwrap();
        let none: GenerationConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(single.eos_token_id.unwrap().to_vec(), vec![7]);
        assert_eq!(many.eos_token_id.unwrap().to_vec(), vec![7, 9]);
        assert!(none.eos_token_id.is_none());
    }
}
