use thiserror::Error;

/// Errors raised while loading or running the vision-language model.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("Hugging Face Api error: {0}")]
    HuggingFaceApi(#[from] hf_hub::api::tokio::ApiError),
    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid model config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Model initialization error: {0}")]
    Init(String),
    #[error("Image features do not match image tokens: {features} features, {tokens} tokens")]
    ImageTokenMismatch { features: usize, tokens: usize },
}

/// Errors a single caption request can end with.
#[derive(Error, Debug)]
pub enum CaptionError {
    /// The uploaded bytes are not a decodable picture.
    #[error("Invalid image file: {0}")]
    Decode(#[from] image::ImageError),
    /// Preprocessing or generation failed inside the model.
    #[error("Caption generation failed: {0}")]
    Generation(#[source] Box<dyn std::error::Error + Send + Sync>),
}
