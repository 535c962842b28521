use serde::{Deserialize, Serialize};

/// Message returned by the liveness route.
pub const HEALTH_MESSAGE: &str = "Caption API is running.";

/// Error body returned, with a 200 status, when the upload is not an image.
pub const INVALID_IMAGE_MESSAGE: &str = "Invalid image file.";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptionResponse {
    pub prompt: String,
    pub caption_raw: String,
    pub caption_wrapped: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
