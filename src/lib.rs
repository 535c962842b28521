//! Image captioning server around a pretrained vision-language model.
//!
//! The model is loaded once into an immutable [`LlavaModel`], shared by every
//! request through a [`CaptionEngine`], and exposed over HTTP by [`router`].

pub mod engine;
pub mod error;
pub mod llava;
pub mod messages;
pub mod model;
pub mod server;
pub mod text;

pub use engine::{CaptionEngine, CaptionEngineConfig, CaptionRequest};
pub use error::{CaptionError, ModelError};
pub use llava::{LlavaModel, LlavaOptions};
pub use messages::{CaptionResponse, ErrorResponse, HealthResponse};
pub use model::{CaptionModel, CaptionModelRequest, CaptionModelResponse, GenerationParams, OutputSpan};
pub use server::router;
pub use text::{chat_prompt, wrap_text};
