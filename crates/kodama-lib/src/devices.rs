//! Audio output device enumeration for the `devices` subcommand.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use kodama_core::AppError;

/// One output device as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// Index usable as `audio.output_device`.
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

pub fn list_output_devices() -> Result<Vec<AudioDeviceInfo>, AppError> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| AppError::AudioGenerationFailed {
            message: format!("failed to enumerate output devices: {e}"),
        })?;

    let mut infos = Vec::new();
    for (index, device) in devices.enumerate() {
        let name = device.name().unwrap_or_else(|_| format!("device {index}"));
        let config = device.default_output_config().ok();
        infos.push(AudioDeviceInfo {
            index,
            is_default: default_name.as_deref() == Some(name.as_str()),
            sample_rate: config.as_ref().map(|c| c.sample_rate().0),
            channels: config.as_ref().map(|c| c.channels()),
            name,
        });
    }
    Ok(infos)
}
