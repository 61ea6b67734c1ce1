//! Demo analysis bot.
//!
//! Logs the dimensions of every frame it receives, publishes a small
//! analysis message per frame, and echoes configuration commands.
//!
//! ```text
//! demo-bot --channel test-camera --input-file replay.bin
//! demo-bot --channel test-camera --endpoint bus.example.com --appkey KEY
//! ```

use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use argus::bot::{BotContext, BotDescriptor, Config, MessageKind, Runtime};
use argus::media::{ImageFrame, PixelFormat};

fn process_image(ctx: &BotContext, frame: &ImageFrame) {
    let metadata = ctx.frame_metadata();
    info!(
        width = metadata.width,
        height = metadata.height,
        id = %frame.id,
        "got frame"
    );
    ctx.message(
        MessageKind::Analysis,
        json!({"width": metadata.width, "height": metadata.height}),
        None,
    );
}

fn process_command(_ctx: &BotContext, command: serde_json::Value) -> Option<serde_json::Value> {
    if command.get("action").and_then(serde_json::Value::as_str) == Some("configure") {
        match command.get("body") {
            Some(body) if body.as_object().is_some_and(|b| !b.is_empty()) => {
                info!(%body, "processing config");
            }
            _ => info!("got no config"),
        }
    }
    None
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let descriptor = BotDescriptor::new(PixelFormat::Bgr24)
        .on_image(process_image)
        .on_command(process_command);

    match Runtime::new(descriptor, config).run() {
        Ok(code) => std::process::exit(code),
        Err(error @ argus::Error::StreamInitialization(_)) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(2);
        }
    }
}
