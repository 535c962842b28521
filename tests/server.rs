use axum::http::{HeaderValue, StatusCode, header};
use axum_test::{
    TestServer,
    multipart::{MultipartForm, Part},
};
use caption_infernum::{
    CaptionEngine, CaptionEngineConfig, CaptionModel, CaptionModelRequest, CaptionModelResponse,
    CaptionResponse, router,
};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;
use std::{io::Cursor, sync::Arc};

#[derive(Debug, thiserror::Error)]
#[error("the model crashed")]
struct Crash;

/// Stands in for the vision-language model: describes the image size and
/// colour of the top-left pixel, or fails when asked to.
struct StubModel {
    fail: bool,
}

impl CaptionModel for StubModel {
    type Error = Crash;

    fn run(&self, request: CaptionModelRequest) -> Result<CaptionModelResponse, Self::Error> {
        if self.fail {
            return Err(Crash);
        }
        assert!(request.prompt.contains("<image>"));
        let (w, h) = request.image.dimensions();
        let Rgb([r, g, b]) = *request.image.get_pixel(0, 0);
        let text = format!(
            "The image is a {w} by {h} picture filled with the colour rgb({r}, {g}, {b}), \
             which looks like a plain square without any objects in it"
        );
        Ok(CaptionModelResponse {
            generated_tokens: text.split_whitespace().count(),
            text,
        })
    }
}

fn server(fail: bool) -> TestServer {
    let engine = CaptionEngine::new(StubModel { fail }, CaptionEngineConfig::default());
    TestServer::new(router(Arc::new(engine))).unwrap()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

fn form(prompt: &str, file: Vec<u8>) -> MultipartForm {
    MultipartForm::new().add_text("prompt", prompt.to_string()).add_part(
        "file",
        Part::bytes(file)
            .file_name("test.png")
            .mime_type("image/png"),
    )
}

#[tokio::test]
async fn home_reports_running() {
    let response = server(false).get("/").await;

    response.assert_status_ok();
    response.assert_json(&json!({ "message": "Caption API is running." }));
}

#[tokio::test]
async fn caption_for_valid_image() {
    let response = server(false)
        .post("/generate-caption")
        .multipart(form("Describe this image.", png(16, 8)))
        .await;

    response.assert_status_ok();
    let body = response.json::<CaptionResponse>();
    assert_eq!(body.prompt, "Describe this image.");
    assert!(body.caption_raw.starts_with("The image is a 16 by 8 picture"));
    assert!(!body.caption_wrapped.is_empty());
    for line in body.caption_wrapped.lines() {
        assert!(line.chars().count() <= 40, "line too long: {line:?}");
    }
    assert_eq!(
        body.caption_wrapped.split_whitespace().collect::<Vec<_>>(),
        body.caption_raw.split_whitespace().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn corrupt_image_is_an_ok_error_body() {
    let response = server(false)
        .post("/generate-caption")
        .multipart(form("Describe this image.", b"\x89PNG not really".to_vec()))
        .await;

    response.assert_status_ok();
    response.assert_json(&json!({ "error": "Invalid image file." }));
}

#[tokio::test]
async fn missing_file_field_is_unprocessable() {
    let response = server(false)
        .post("/generate-caption")
        .multipart(MultipartForm::new().add_text("prompt", "Describe this image."))
        .await;

    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    response.assert_json(&json!({ "error": "missing form field: file" }));
}

#[tokio::test]
async fn missing_prompt_field_is_unprocessable() {
    let response = server(false)
        .post("/generate-caption")
        .multipart(MultipartForm::new().add_part("file", Part::bytes(png(2, 2))))
        .await;

    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    response.assert_json(&json!({ "error": "missing form field: prompt" }));
}

#[tokio::test]
async fn empty_prompt_is_unprocessable() {
    let response = server(false)
        .post("/generate-caption")
        .multipart(form("", png(2, 2)))
        .await;

    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    response.assert_json(&json!({ "error": "missing form field: prompt" }));
}

#[tokio::test]
async fn generation_failure_is_a_server_fault() {
    let response = server(true)
        .post("/generate-caption")
        .multipart(form("Describe this image.", png(4, 4)))
        .await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    response.assert_json(&json!({ "error": "Caption generation failed." }));
}

#[tokio::test]
async fn cors_allows_any_origin_with_credentials() {
    let response = server(false)
        .get("/")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://example.com"))
        .await;

    response.assert_status_ok();
    let headers = response.headers();
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "http://example.com"
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
        "true"
    );
}
