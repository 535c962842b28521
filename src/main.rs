use argh::FromArgs;
use caption_infernum::{
    CaptionEngine, CaptionEngineConfig, GenerationParams, LlavaModel, LlavaOptions, OutputSpan,
    llava::{DEFAULT_MODEL_ID, DEFAULT_REVISION},
    router,
};
use std::sync::Arc;

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

#[derive(FromArgs)]
/// Caption API: generates image captions with a vision-language model.
struct CaptionArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// the Hugging Face model repository to load
    #[argh(option, default = "DEFAULT_MODEL_ID.to_string()")]
    model_id: String,

    /// the model repository revision
    #[argh(option, default = "DEFAULT_REVISION.to_string()")]
    revision: String,

    /// maximum number of generated tokens per caption
    #[argh(option, default = "GenerationParams::default().max_new_tokens")]
    max_new_tokens: usize,

    /// column width of the wrapped caption
    #[argh(option, default = "caption_infernum::engine::DEFAULT_WRAP_WIDTH")]
    wrap_width: usize,

    /// run on the CPU even if an accelerator is available
    #[argh(switch)]
    cpu: bool,

    /// decode only the generated tokens, leaving the echoed prompt out
    #[argh(switch)]
    strip_prompt: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: CaptionArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let model = LlavaModel::from_hub(&LlavaOptions {
        model_id: args.model_id,
        revision: args.revision,
        force_cpu: args.cpu,
        ..Default::default()
    })
    .await?;
    log::info!(
        "Model ready on {:?} ({:?})",
        model.device(),
        model.dtype()
    );

    let output_span = if args.strip_prompt {
        OutputSpan::NewTokens
    } else {
        OutputSpan::default()
    };
    let engine = Arc::new(CaptionEngine::new(
        model,
        CaptionEngineConfig {
            params: GenerationParams {
                max_new_tokens: args.max_new_tokens,
                output_span,
            },
            wrap_width: args.wrap_width,
        },
    ));

    let app = router(engine);

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
