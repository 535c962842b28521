//! LLaVA captioning model: a SigLIP vision tower whose patch features are
//! projected into the embedding space of a Qwen2 decoder.

pub mod config;
mod generation;
mod processor;
mod qwen2;
mod siglip;

pub use processor::{LlavaProcessor, ProcessorOptions};

use crate::{
    error::ModelError,
    model::{CaptionModel, CaptionModelRequest, CaptionModelResponse, OutputSpan},
};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Activation, Linear, VarBuilder};
use config::{GenerationConfig, LlavaConfig, PreprocessorConfig};
use hf_hub::{Repo, RepoType, api::tokio::Api};
use image::RgbImage;
use qwen2::{Cache, Qwen2Model};
use siglip::SiglipVisionTower;
use std::{collections::BTreeSet, path::PathBuf};

pub const DEFAULT_MODEL_ID: &str = "llava-hf/llava-interleave-qwen-0.5b-hf";
pub const DEFAULT_REVISION: &str = "main";

/// Where the model comes from and how it is set up.
#[derive(Clone, Debug)]
pub struct LlavaOptions {
    pub model_id: String,
    pub revision: String,
    /// Skips accelerator detection and runs on the CPU.
    pub force_cpu: bool,
    pub processor: ProcessorOptions,
}

impl Default for LlavaOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            force_cpu: false,
            processor: ProcessorOptions::default(),
        }
    }
}

/// Local paths of the files making up a model repository.
pub struct ModelFiles {
    pub config: PathBuf,
    pub preprocessor_config: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Downloads (or reuses from the local cache) every file of the repository.
    pub async fn from_hub(model_id: &str, revision: &str) -> Result<Self, ModelError> {
        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let config = repo.get("config.json").await?;
        let preprocessor_config = repo.get("preprocessor_config.json").await?;
        let tokenizer = repo.get("tokenizer.json").await?;
        let generation_config = repo.get("generation_config.json").await.ok();

        let weights = match repo.get("model.safetensors.index.json").await {
            Ok(index) => {
                let mut weights = Vec::new();
                for file in weight_files(&std::fs::read_to_string(index)?)? {
                    weights.push(repo.get(&file).await?);
                }
                weights
            }
            Err(_) => vec![repo.get("model.safetensors").await?],
        };

        Ok(Self {
            config,
            preprocessor_config,
            generation_config,
            tokenizer,
            weights,
        })
    }
}

/// Lists the shard files referenced by a safetensors index.
fn weight_files(index: &str) -> Result<BTreeSet<String>, ModelError> {
    let index: serde_json::Value = serde_json::from_str(index)?;
    let weight_map = index
        .get("weight_map")
        .and_then(|map| map.as_object())
        .ok_or_else(|| ModelError::Init("no weight_map in safetensors index".into()))?;
    Ok(weight_map
        .values()
        .filter_map(|file| file.as_str().map(str::to_string))
        .collect())
}

/// Picks an accelerator when one was compiled in and is present.
pub fn select_device(force_cpu: bool) -> Result<Device, ModelError> {
    if force_cpu {
        log::info!("Forced to CPU device");
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        log::info!("CUDA is available, using CUDA device");
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        log::info!("Metal is available, using Metal device");
        Ok(Device::new_metal(0)?)
    } else {
        log::info!("No GPU available, using CPU device");
        Ok(Device::Cpu)
    }
}

/// Reduced precision on accelerators, full precision on the CPU.
pub fn select_dtype(device: &Device) -> DType {
    if device.is_cpu() { DType::F32 } else { DType::F16 }
}

/// Two layer MLP mapping vision features onto text embeddings.
struct MultiModalProjector {
    linear_1: Linear,
    act: Activation,
    linear_2: Linear,
}

impl MultiModalProjector {
    fn new(cfg: &LlavaConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let (vision, text) = (cfg.vision_config.hidden_size, cfg.text_config.hidden_size);
        Ok(Self {
            linear_1: candle_nn::linear(vision, text, vb.pp("linear_1"))?,
            act: cfg.projector_hidden_act,
            linear_2: candle_nn::linear(text, text, vb.pp("linear_2"))?,
        })
    }
}

impl Module for MultiModalProjector {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.linear_1)?.apply(&self.act)?.apply(&self.linear_2)
    }
}

/// Runs the vision tower up to the configured layer and projects the selected
/// patch states, giving `(num_features, hidden)`.
fn project_image(
    vision_tower: &SiglipVisionTower,
    projector: &MultiModalProjector,
    config: &LlavaConfig,
    pixel_values: &Tensor,
) -> candle_core::Result<Tensor> {
    let hidden = vision_tower.hidden_states(pixel_values, config.vision_feature_layer)?;
    let selected = if config.vision_feature_select_strategy == "default" {
        hidden.narrow(1, 1, hidden.dim(1)? - 1)?
    } else {
        hidden
    };
    projector.forward(&selected)?.squeeze(0)
}

/// The loaded model, immutable once built.
pub struct LlavaModel {
    vision_tower: SiglipVisionTower,
    projector: MultiModalProjector,
    language_model: Qwen2Model,
    processor: LlavaProcessor,
    config: LlavaConfig,
    eos_token_ids: Vec<u32>,
    device: Device,
    dtype: DType,
}

impl LlavaModel {
    /// Fetches the repository and loads it on the best available device.
    pub async fn from_hub(options: &LlavaOptions) -> Result<Self, ModelError> {
        log::info!(
            "Loading model and processor from {}@{}",
            options.model_id,
            options.revision
        );
        let files = ModelFiles::from_hub(&options.model_id, &options.revision).await?;
        let device = select_device(options.force_cpu)?;
        Self::load(&files, device, &options.processor)
    }

    pub fn load(
        files: &ModelFiles,
        device: Device,
        processor_options: &ProcessorOptions,
    ) -> Result<Self, ModelError> {
        let dtype = select_dtype(&device);
        log::info!("Running on device {device:?} with {dtype:?}");

        let config: LlavaConfig = serde_json::from_str(&std::fs::read_to_string(&files.config)?)?;
        let preprocessor: PreprocessorConfig =
            serde_json::from_str(&std::fs::read_to_string(&files.preprocessor_config)?)?;
        let generation_config: GenerationConfig = match &files.generation_config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => GenerationConfig::default(),
        };

        let tokenizer = tokenizers::Tokenizer::from_file(&files.tokenizer)?;
        let processor = LlavaProcessor::new(
            tokenizer,
            preprocessor,
            processor_options,
            config.image_token_index,
        )?;
        log::debug!(
            "Image placeholder expands to {} tokens",
            processor.num_image_tokens()
        );

        let eos_token_ids = eos_token_ids(&config, &generation_config, &processor)?;
        log::debug!("End of sequence tokens: {eos_token_ids:?}");

        // # Safety:
        //
        // Nothing guarantees that the safetensors files are not updated afterwards. For more
        // info look at [`memmap2::MmapOptions`]
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let vision_tower = SiglipVisionTower::new(
            &config.vision_config,
            vb.pp("vision_tower").pp("vision_model"),
        )?;
        let projector = MultiModalProjector::new(&config, vb.pp("multi_modal_projector"))?;
        let language_model = Qwen2Model::new(&config.text_config, vb.pp("language_model"))?;

        log::info!("Model is initialized");

        Ok(Self {
            vision_tower,
            projector,
            language_model,
            processor,
            config,
            eos_token_ids,
            device,
            dtype,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Projected image features, shaped `(num_features, hidden)`.
    fn image_features(&self, image: &RgbImage) -> Result<Tensor, ModelError> {
        let pixel_values = self.processor.preprocess(image, &self.device, self.dtype)?;
        Ok(project_image(
            &self.vision_tower,
            &self.projector,
            &self.config,
            &pixel_values,
        )?)
    }

    /// Encodes the prompt and image, then greedily generates up to
    /// `max_new_tokens` tokens. Returns the prompt ids and the generated ids.
    fn generate(
        &self,
        prompt: &str,
        image: &RgbImage,
        max_new_tokens: usize,
    ) -> Result<(Vec<u32>, Vec<u32>), ModelError> {
        let prompt_ids = self.processor.tokenize(prompt)?;
        let image_features = self.image_features(image)?;
        let embeds = input_embeddings(
            &self.language_model,
            &prompt_ids,
            &image_features,
            self.processor.image_token_id(),
        )?;
        let generated = generate_from_embeddings(
            &self.language_model,
            &embeds,
            max_new_tokens,
            &self.eos_token_ids,
        )?;
        Ok((prompt_ids, generated))
    }
}

/// Text embeddings of `ids` with each run of image tokens replaced by the
/// image features.
fn input_embeddings(
    language_model: &Qwen2Model,
    ids: &[u32],
    image_features: &Tensor,
    image_token_id: u32,
) -> Result<Tensor, ModelError> {
    let num_features = image_features.dim(0)?;
    let num_image_tokens = ids.iter().filter(|&&id| id == image_token_id).count();
    if num_image_tokens != num_features {
        return Err(ModelError::ImageTokenMismatch {
            features: num_features,
            tokens: num_image_tokens,
        });
    }

    let image_features = image_features
        .unsqueeze(0)?
        .to_dtype(language_model.dtype())?;
    let mut segments = Vec::new();
    for run in ids.chunk_by(|a, b| (*a == image_token_id) == (*b == image_token_id)) {
        if run[0] == image_token_id {
            segments.push(image_features.clone());
        } else {
            segments.push(language_model.embed(run)?);
        }
    }
    Ok(Tensor::cat(&segments, 1)?)
}

/// Prefills the decoder with `embeds`, then decodes greedily with a cache
/// owned by this call.
fn generate_from_embeddings(
    language_model: &Qwen2Model,
    embeds: &Tensor,
    max_new_tokens: usize,
    eos_token_ids: &[u32],
) -> Result<Vec<u32>, ModelError> {
    let mut cache = Cache::new(language_model.num_layers());
    let first_logits = language_model.forward_embeds(embeds, 0, &mut cache)?;

    let mut offset = embeds.dim(1)?;
    let generated = generation::greedy_generate(
        first_logits,
        |token| {
            let embeds = language_model.embed(&[token])?;
            let logits = language_model.forward_embeds(&embeds, offset, &mut cache)?;
            offset += 1;
            Ok(logits)
        },
        max_new_tokens,
        eos_token_ids,
    )?;
    Ok(generated)
}

/// End of sequence tokens from the generation config, the text config, and
/// the chat end-of-turn marker.
fn eos_token_ids(
    config: &LlavaConfig,
    generation_config: &GenerationConfig,
    processor: &LlavaProcessor,
) -> Result<Vec<u32>, ModelError> {
    let mut ids: Vec<u32> = generation_config
        .eos_token_id
        .as_ref()
        .map(|ids| ids.to_vec())
        .unwrap_or_default();
    ids.extend(config.text_config.eos_token_id);
    ids.extend(processor.token_id("<|im_end|>"));
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(ModelError::Init("cannot find the end of sequence token".into()));
    }
    Ok(ids)
}

/// The part of the output sequence that is decoded into the caption.
fn output_tokens(prompt_ids: &[u32], generated: &[u32], span: OutputSpan) -> Vec<u32> {
    match span {
        OutputSpan::FullSequence { skip } => prompt_ids
            .iter()
            .chain(generated)
            .skip(skip)
            .copied()
            .collect(),
        OutputSpan::NewTokens => generated.to_vec(),
    }
}

impl CaptionModel for LlavaModel {
    type Error = ModelError;

    fn run(&self, request: CaptionModelRequest) -> Result<CaptionModelResponse, Self::Error> {
        let (prompt_ids, generated) =
            self.generate(&request.prompt, &request.image, request.params.max_new_tokens)?;
        let output = output_tokens(&prompt_ids, &generated, request.params.output_span);
        let text = self.processor.decode(&output, true)?;
        Ok(CaptionModelResponse {
            text,
            generated_tokens: generated.len(),
        })
    }
}
