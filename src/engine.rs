use crate::{
    error::CaptionError,
    messages::CaptionResponse,
    model::{CaptionModel, CaptionModelRequest, GenerationParams},
    text::{chat_prompt, wrap_text},
};
use image::RgbImage;
use std::{sync::Arc, time::Instant};

/// Column width captions are reflowed to.
pub const DEFAULT_WRAP_WIDTH: usize = 40;

/// Settings fixed for the lifetime of a [`CaptionEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptionEngineConfig {
    pub params: GenerationParams,
    pub wrap_width: usize,
}

impl Default for CaptionEngineConfig {
    fn default() -> Self {
        Self {
            params: GenerationParams::default(),
            wrap_width: DEFAULT_WRAP_WIDTH,
        }
    }
}

/// A decoded caption request.
pub struct CaptionRequest {
    pub prompt: String,
    pub image: RgbImage,
}

/// Caption service on top of a shared, read-only model.
///
/// Every request runs its own generation pass on the blocking thread pool. The
/// engine adds no locking or queueing of its own: whether concurrent passes
/// actually overlap is up to the model's compute device.
pub struct CaptionEngine<M: CaptionModel> {
    model: Arc<M>,
    config: CaptionEngineConfig,
}

impl<M: CaptionModel> Clone for CaptionEngine<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            config: self.config,
        }
    }
}

impl<M: CaptionModel> CaptionEngine<M> {
    /// Creates a new engine around an already loaded model.
    pub fn new(model: M, config: CaptionEngineConfig) -> Self {
        Self {
            model: Arc::new(model),
            config,
        }
    }

    /// Generates the raw caption for `image` following `prompt`.
    ///
    /// This is a blocking, compute bound call with no cancellation.
    pub fn generate_caption(&self, image: RgbImage, prompt: &str) -> Result<String, CaptionError> {
        let start_time = Instant::now();

        let response = self
            .model
            .run(CaptionModelRequest {
                prompt: chat_prompt(prompt),
                image,
                params: self.config.params,
            })
            .map_err(|e| CaptionError::Generation(Box::new(e)))?;

        log::debug!(
            "Generated {} tokens in {:?}",
            response.generated_tokens,
            start_time.elapsed()
        );

        Ok(response.text)
    }

    /// Runs a full caption request: generation on the blocking pool, then wrapping.
    pub async fn caption(&self, request: CaptionRequest) -> Result<CaptionResponse, CaptionError> {
        let CaptionRequest { prompt, image } = request;
        let start_time = Instant::now();

        let caption_raw = {
            let engine = self.clone();
            let prompt = prompt.clone();
            tokio::task::spawn_blocking(move || engine.generate_caption(image, &prompt))
                .await
                .map_err(|e| CaptionError::Generation(Box::new(e)))??
        };
        log::info!("Generated raw caption: {caption_raw}");

        let caption_wrapped = wrap_text(&caption_raw, self.config.wrap_width);
        log::info!(
            "Returning wrapped caption after {:?}: {caption_wrapped}",
            start_time.elapsed()
        );

        Ok(CaptionResponse {
            prompt,
            caption_raw,
            caption_wrapped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaptionModelResponse, OutputSpan};
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("out of memory")]
    struct OutOfMemory;

    /// Remembers what it was asked and answers with a fixed text.
    struct RecordingModel {
        answer: Result<String, ()>,
        seen: Mutex<Vec<(String, (u32, u32), GenerationParams)>>,
    }

    impl RecordingModel {
        fn answering(answer: &str) -> Self {
            Self {
                answer: Ok(answer.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl CaptionModel for RecordingModel {
        type Error = OutOfMemory;

        fn run(&self, request: CaptionModelRequest) -> Result<CaptionModelResponse, Self::Error> {
            self.seen.lock().unwrap().push((
                request.prompt,
                request.image.dimensions(),
                request.params,
            ));
            let text = self.answer.clone().map_err(|_| OutOfMemory)?;
            Ok(CaptionModelResponse {
                generated_tokens: text.split_whitespace().count(),
                text,
            })
        }
    }

    #[test]
    fn generate_caption_templates_the_prompt() {
        let engine = CaptionEngine::new(
            RecordingModel::answering("a red square"),
            CaptionEngineConfig::default(),
        );

        let caption = engine
            .generate_caption(RgbImage::new(4, 3), "Describe this image.")
            .unwrap();

        assert_eq!(caption, "a red square");
        let seen = engine.model.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, chat_prompt("Describe this image."));
        assert_eq!(seen[0].1, (4, 3));
        assert_eq!(seen[0].2.max_new_tokens, 150);
        assert_eq!(seen[0].2.output_span, OutputSpan::FullSequence { skip: 2 });
    }

    #[test]
    fn generate_caption_surfaces_model_failures() {
        let model = RecordingModel {
            answer: Err(()),
            seen: Mutex::new(Vec::new()),
        };
        let engine = CaptionEngine::new(model, CaptionEngineConfig::default());

        let err = engine
            .generate_caption(RgbImage::new(1, 1), "hi")
            .unwrap_err();
        assert!(matches!(err, CaptionError::Generation(_)));
    }

    #[tokio::test]
    async fn caption_wraps_and_echoes_prompt() {
        let engine = CaptionEngine::new(
            RecordingModel::answering("one two three four five six"),
            CaptionEngineConfig {
                wrap_width: 9,
                ..Default::default()
            },
        );

        let response = engine
            .caption(CaptionRequest {
                prompt: "What is this?".to_string(),
                image: RgbImage::new(2, 2),
            })
            .await
            .unwrap();

        assert_eq!(response.prompt, "What is this?");
        assert_eq!(response.caption_raw, "one two three four five six");
        assert_eq!(response.caption_wrapped, "one two\nthree\nfour five\nsix");
    }
}
