use argh::FromArgs;
use std::path::PathBuf;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8000;

#[derive(FromArgs)]
/// Caption API client for requesting captions and checking the server
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "caption" or "health"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Caption(CaptionCommand),
    Health(HealthCommand),
}

#[derive(FromArgs)]
/// Upload an image and a prompt to get a caption
#[argh(subcommand, name = "caption")]
struct CaptionCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// the prompt to use
    #[argh(option, short = 'p', default = "String::from(\"Describe this image.\")")]
    prompt: String,
}

#[derive(FromArgs)]
/// Check that the server is running
#[argh(subcommand, name = "health")]
struct HealthCommand {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    match args.command {
        ClientCommands::Caption(caption_command) => {
            let file_name = caption_command
                .image_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("image")
                .to_string();
            let bytes = tokio::fs::read(&caption_command.image_path).await?;

            let form = reqwest::multipart::Form::new()
                .text("prompt", caption_command.prompt)
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(bytes).file_name(file_name),
                );

            let response = client
                .post(format!("http://{}/generate-caption", addr))
                .multipart(form)
                .send()
                .await?;

            let result = response.json::<serde_json::Value>().await?;
            match serde_json::from_value::<caption_infernum::CaptionResponse>(result.clone()) {
                Ok(caption) => println!("{}", caption.caption_wrapped),
                Err(_) => println!("Result: {}", serde_json::to_string_pretty(&result)?),
            }
        }
        ClientCommands::Health(_) => {
            let response = client.get(format!("http://{}/", addr)).send().await?;

            let result = response.json::<serde_json::Value>().await?;
            println!("Result: {}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
