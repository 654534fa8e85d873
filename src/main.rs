//! Grab frames from /dev/video0 and report them.

use log::{error, info, warn};
use v4l_grab::{CameraDevice, CaptureSession, DeviceConfig, OutputImage};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        error!("{err}");
        std::process::exit(1);
    }
}

fn run() -> v4l_grab::Result<()> {
    let config = DeviceConfig::default();
    let mut session = CaptureSession::new();
    session.start(config)?;

    if let Some(device) = session.device() {
        let caps = device.capabilities();
        info!("Device: {} ({})", caps.card, caps.driver);
    }

    let mut image = OutputImage::new();
    loop {
        match session.grab(&mut image) {
            Ok(()) => info!(
                "Frame {}: {}x{} {} ({} bytes), timestamp: {:?}",
                image.sequence,
                image.width,
                image.height,
                image.encoding,
                image.data.len(),
                image.timestamp
            ),
            Err(err) if err.is_recoverable() => warn!("skipping frame: {err}"),
            Err(err) => return Err(err),
        }
    }
}
