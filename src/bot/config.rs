//! Runtime configuration and CLI flags.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

/// Bot runtime configuration.
#[derive(Parser, Debug, Clone)]
#[command(about = "Video analysis bot", version)]
pub struct Config {
    /// Bus endpoint host.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Bus application key.
    #[arg(long)]
    pub appkey: Option<String>,

    /// Bus endpoint port.
    #[arg(long, default_value_t = 443)]
    pub port: u16,

    /// Base channel of the stream.
    #[arg(long)]
    pub channel: String,

    /// Replay packets from a file instead of the bus.
    #[arg(long, value_name = "PATH")]
    pub input_file: Option<PathBuf>,

    /// Restart the input file at end of stream.
    #[arg(long)]
    pub loop_file: bool,

    /// Capture from the platform camera.
    #[arg(long)]
    pub input_camera: bool,

    /// Subscribe to the bus for frames. Default when no other input is
    /// selected.
    #[arg(long)]
    pub input_bus: bool,

    /// Downscale decoded frames to at most this width.
    #[arg(long)]
    pub image_width: Option<u32>,

    /// Downscale decoded frames to at most this height.
    #[arg(long)]
    pub image_height: Option<u32>,
}

/// Which source feeds the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputKind {
    /// Replay from a file.
    File(PathBuf),
    /// Live capture.
    Camera,
    /// Bus subscription.
    Bus,
}

impl Config {
    /// The selected input.
    pub fn input(&self) -> InputKind {
        if let Some(path) = &self.input_file {
            InputKind::File(path.clone())
        } else if self.input_camera {
            InputKind::Camera
        } else {
            InputKind::Bus
        }
    }

    /// Requested downscale box, when both dimensions are set.
    pub fn image_size(&self) -> Option<(u32, u32)> {
        match (self.image_width, self.image_height) {
            (Some(width), Some(height)) => Some((width, height)),
            _ => None,
        }
    }

    /// Check flag consistency before starting the reactor.
    pub fn validate(&self) -> Result<()> {
        let inputs = [self.input_file.is_some(), self.input_camera, self.input_bus]
            .into_iter()
            .filter(|selected| *selected)
            .count();
        if inputs > 1 {
            return Err(Error::StreamInitialization(
                "more than one input selected".into(),
            ));
        }
        if self.input() == InputKind::Bus && self.endpoint.is_none() {
            return Err(Error::StreamInitialization(
                "bus input requires --endpoint and --appkey".into(),
            ));
        }
        if self.endpoint.is_some() && self.appkey.is_none() {
            return Err(Error::StreamInitialization(
                "--endpoint requires --appkey".into(),
            ));
        }
        if self.image_width.is_some() != self.image_height.is_some() {
            return Err(Error::StreamInitialization(
                "--image-width and --image-height go together".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("argus-bot").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_input_is_bus() {
        let config = parse(&["--channel", "cam", "--endpoint", "e", "--appkey", "k"]);
        assert_eq!(config.input(), InputKind::Bus);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_input_needs_no_endpoint() {
        let config = parse(&["--channel", "cam", "--input-file", "replay.bin"]);
        assert_eq!(config.input(), InputKind::File(PathBuf::from("replay.bin")));
        config.validate().unwrap();
    }

    #[test]
    fn test_bus_input_without_endpoint_fails_validation() {
        let config = parse(&["--channel", "cam"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conflicting_inputs_fail_validation() {
        let config = parse(&[
            "--channel",
            "cam",
            "--input-file",
            "replay.bin",
            "--input-camera",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_size_requires_both_dimensions() {
        let config = parse(&[
            "--channel",
            "cam",
            "--input-file",
            "replay.bin",
            "--image-width",
            "320",
        ]);
        assert!(config.validate().is_err());
    }
}
