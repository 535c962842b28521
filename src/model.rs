use image::RgbImage;

/// Which part of the generated token sequence is turned back into text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputSpan {
    /// Prompt tokens followed by the generated tokens, minus the first `skip`
    /// positions. The echoed prompt text stays in the caption.
    FullSequence { skip: usize },
    /// Only the newly generated tokens.
    NewTokens,
}

impl Default for OutputSpan {
    fn default() -> Self {
        OutputSpan::FullSequence { skip: 2 }
    }
}

/// Fixed decoding parameters of a caption request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationParams {
    /// Upper bound on the number of generated tokens.
    pub max_new_tokens: usize,
    /// Slice of the output sequence that gets decoded.
    pub output_span: OutputSpan,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 150,
            output_span: OutputSpan::default(),
        }
    }
}

pub struct CaptionModelRequest {
    /// Fully templated chat prompt, including the image placeholder.
    pub prompt: String,
    pub image: RgbImage,
    pub params: GenerationParams,
}

pub struct CaptionModelResponse {
    pub text: String,
    pub generated_tokens: usize,
}

/// A loaded vision-language model that turns an image and a prompt into text.
///
/// Implementations are shared read-only across requests, so `run` takes `&self`
/// and must keep any per-call state (e.g. the attention cache) local to the call.
pub trait CaptionModel: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn run(&self, request: CaptionModelRequest) -> Result<CaptionModelResponse, Self::Error>;
}
