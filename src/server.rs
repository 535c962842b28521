use crate::{
    engine::{CaptionEngine, CaptionRequest},
    error::CaptionError,
    messages::{ErrorResponse, HEALTH_MESSAGE, HealthResponse, INVALID_IMAGE_MESSAGE},
    model::CaptionModel,
};
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

/// Largest accepted multipart body.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Everything a caption request can fail with at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    Form(String),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Rejection(#[from] MultipartRejection),
    #[error(transparent)]
    Caption(#[from] CaptionError),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        match self {
            RequestError::Form(reason) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorResponse::new(reason))).into_response()
            }
            // Keeps the status axum picked, e.g. 413 for an oversized body.
            RequestError::Multipart(e) => {
                (e.status(), Json(ErrorResponse::new(e.body_text()))).into_response()
            }
            RequestError::Rejection(e) => {
                (e.status(), Json(ErrorResponse::new(e.body_text()))).into_response()
            }
            // Undecodable uploads are answered with a 200 and an error body.
            RequestError::Caption(CaptionError::Decode(_)) => {
                (StatusCode::OK, Json(ErrorResponse::new(INVALID_IMAGE_MESSAGE))).into_response()
            }
            RequestError::Caption(CaptionError::Generation(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Caption generation failed.")),
            )
                .into_response(),
        }
    }
}

/// Builds the application router around a caption engine.
pub fn router<M: CaptionModel>(engine: Arc<CaptionEngine<M>>) -> Router {
    router_with_body_limit(engine, MAX_UPLOAD_BYTES)
}

fn router_with_body_limit<M: CaptionModel>(
    engine: Arc<CaptionEngine<M>>,
    body_limit: usize,
) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/generate-caption", post(generate_caption::<M>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(permissive_cors())
        .with_state(engine)
}

/// Allows any origin, method and header, with credentials.
///
/// A literal `*` cannot be combined with credentials, so the request values
/// are mirrored back instead.
fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn home() -> Json<HealthResponse> {
    log::info!("Health check endpoint was called");
    Json(HealthResponse {
        message: HEALTH_MESSAGE.to_string(),
    })
}

async fn generate_caption<M: CaptionModel>(
    State(engine): State<Arc<CaptionEngine<M>>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, RequestError> {
    let (prompt, image_bytes) = read_form(multipart?).await?;
    log::info!("Received caption generation request with prompt: {prompt}");

    let image = match image::load_from_memory(&image_bytes) {
        Ok(image) => image.to_rgb8(),
        Err(e) => {
            log::error!("Error reading the image file: {e}");
            return Err(CaptionError::Decode(e).into());
        }
    };

    let response = engine
        .caption(CaptionRequest { prompt, image })
        .await
        .inspect_err(|e| log::error!("{e}"))?;

    Ok(Json(response))
}

/// Pulls the `prompt` and `file` fields out of the form, reading the file fully
/// into memory.
async fn read_form(mut multipart: Multipart) -> Result<(String, Vec<u8>), RequestError> {
    let mut prompt = None;
    let mut file = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("prompt") => prompt = Some(field.text().await?),
            Some("file") => file = Some(field.bytes().await?.to_vec()),
            _ => {}
        }
    }

    let prompt = prompt
        .filter(|prompt| !prompt.is_empty())
        .ok_or_else(|| RequestError::Form("missing form field: prompt".into()))?;
    let file = file.ok_or_else(|| RequestError::Form("missing form field: file".into()))?;
    Ok((prompt, file))
}
