use super::config::PreprocessorConfig;
use crate::{error::ModelError, text::IMAGE_TOKEN};
use candle_core::{DType, Device, Tensor};
use image::{RgbImage, imageops::FilterType};
use tokenizers::Tokenizer;

/// Processor options that have to be set by hand for this model family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorOptions {
    pub patch_size: usize,
    pub vision_feature_select_strategy: String,
    /// Extra placeholder tokens per image on top of one per patch.
    pub num_additional_image_tokens: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            patch_size: 14,
            vision_feature_select_strategy: "mean".to_string(),
            num_additional_image_tokens: 0,
        }
    }
}

/// Turns prompts and pictures into model inputs, and output ids back into text.
pub struct LlavaProcessor {
    tokenizer: Tokenizer,
    image_token_id: u32,
    num_image_tokens: usize,
    preprocessor: PreprocessorConfig,
}

impl LlavaProcessor {
    pub fn new(
        tokenizer: Tokenizer,
        preprocessor: PreprocessorConfig,
        options: &ProcessorOptions,
        image_token_id: u32,
    ) -> Result<Self, ModelError> {
        if tokenizer.token_to_id(IMAGE_TOKEN).is_none() {
            return Err(ModelError::Init(format!(
                "tokenizer has no {IMAGE_TOKEN} token"
            )));
        }
        let num_image_tokens = num_image_tokens(&preprocessor, options)?;
        Ok(Self {
            tokenizer,
            image_token_id,
            num_image_tokens,
            preprocessor,
        })
    }

    pub fn num_image_tokens(&self) -> usize {
        self.num_image_tokens
    }

    pub fn image_token_id(&self) -> u32 {
        self.image_token_id
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Tokenizes a templated prompt, expanding each image placeholder into one
    /// token per image feature.
    pub fn tokenize(&self, prompt: &str) -> Result<Vec<u32>, ModelError> {
        let encoding = self.tokenizer.encode(prompt, true)?;
        Ok(expand_image_tokens(
            encoding.get_ids(),
            self.image_token_id,
            self.num_image_tokens,
        ))
    }

    /// Resizes, rescales and normalizes `image` into a `(1, 3, h, w)` tensor.
    pub fn preprocess(
        &self,
        image: &RgbImage,
        device: &Device,
        dtype: DType,
    ) -> candle_core::Result<Tensor> {
        let cfg = &self.preprocessor;
        let (width, height) = (cfg.size.width, cfg.size.height);

        let resized;
        let image = if cfg.do_resize && image.dimensions() != (width, height) {
            resized = image::imageops::resize(image, width, height, filter_type(cfg.resample));
            &resized
        } else {
            image
        };
        let (w, h) = image.dimensions();

        let mut pixels = Tensor::from_vec(
            image.as_raw().clone(),
            (h as usize, w as usize, 3),
            &Device::Cpu,
        )?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
        if cfg.do_rescale {
            pixels = (pixels * cfg.rescale_factor as f64)?;
        }
        if cfg.do_normalize {
            let mean = Tensor::new(&cfg.image_mean, &Device::Cpu)?.reshape((3, 1, 1))?;
            let std = Tensor::new(&cfg.image_std, &Device::Cpu)?.reshape((3, 1, 1))?;
            pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
        }

        pixels.unsqueeze(0)?.to_device(device)?.to_dtype(dtype)
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ModelError> {
        Ok(self.tokenizer.decode(ids, skip_special_tokens)?)
    }
}

/// One placeholder per patch, plus the additional ones, minus the class token
/// under the "default" selection strategy.
fn num_image_tokens(
    preprocessor: &PreprocessorConfig,
    options: &ProcessorOptions,
) -> Result<usize, ModelError> {
    if options.patch_size == 0 {
        return Err(ModelError::Init("patch size must be positive".into()));
    }
    let patches = (preprocessor.size.height as usize / options.patch_size)
        * (preprocessor.size.width as usize / options.patch_size);
    let tokens = patches + options.num_additional_image_tokens;
    if options.vision_feature_select_strategy == "default" {
        Ok(tokens.saturating_sub(1))
    } else {
        Ok(tokens)
    }
}

fn expand_image_tokens(ids: &[u32], image_token_id: u32, count: usize) -> Vec<u32> {
    let placeholders = ids.iter().filter(|&&id| id == image_token_id).count();
    let mut expanded = Vec::with_capacity(ids.len() + placeholders * count.saturating_sub(1));
    for &id in ids {
        if id == image_token_id {
            expanded.extend(std::iter::repeat_n(image_token_id, count));
        } else {
            expanded.push(id);
        }
    }
    expanded
}

/// PIL resampling codes.
fn filter_type(resample: u32) -> FilterType {
    match resample {
        0 => FilterType::Nearest,
        2 => FilterType::Triangle,
        3 => FilterType::CatmullRom,
        _ => FilterType::Lanczos3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llava::config::ImageSize;

    #[test]
    fn image_tokens_cover_every_patch() {
        let preprocessor = PreprocessorConfig::default();
        let options = ProcessorOptions::default();
        assert_eq!(num_image_tokens(&preprocessor, &options).unwrap(), 729);
    }

    #[test]
    fn default_strategy_drops_the_class_token() {
        let preprocessor = PreprocessorConfig {
            size: ImageSize {
                height: 336,
                width: 336,
            },
            ..Default::default()
        };
        let options = ProcessorOptions {
            vision_feature_select_strategy: "default".to_string(),
            num_additional_image_tokens: 1,
            ..Default::default()
        };
        assert_eq!(num_image_tokens(&preprocessor, &options).unwrap(), 576);
    }

    #[test]
    fn zero_patch_size_is_rejected() {
        let options = ProcessorOptions {
            patch_size: 0,
            ..Default::default()
        };
        assert!(num_image_tokens(&PreprocessorConfig::default(), &options).is_err());
    }

    #[test]
    fn expands_each_placeholder() {
        assert_eq!(
            expand_image_tokens(&[1, 9, 2, 3], 9, 3),
            vec![1, 9, 9, 9, 2, 3]
        );
        assert_eq!(expand_image_tokens(&[1, 2], 9, 3), vec![1, 2]);
        assert_eq!(expand_image_tokens(&[9, 9], 9, 2), vec![9, 9, 9, 9]);
    }

    #[test]
    fn resample_codes_follow_pil() {
        assert_eq!(filter_type(3), FilterType::CatmullRom);
        assert_eq!(filter_type(0), FilterType::Nearest);
    }
}
