//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::{AudioError, DeviceFailure};

/// Which side of the host a device is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Input => "input:",
            Direction::Output => "output:",
        }
    }
}

/// Device summary for the UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
    pub default_sample_rate: Option<u32>,
    pub default_channels: Option<u16>,
}

/// A resolved cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub direction: Direction,
}

impl AudioDevice {
    fn new(inner: cpal::Device, direction: Direction) -> Self {
        let name = inner.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner,
            name,
            direction,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Default stream shape for the device's direction
    pub fn default_config(&self) -> Result<cpal::SupportedStreamConfig, AudioError> {
        let result = match self.direction {
            Direction::Input => self.inner.default_input_config(),
            Direction::Output => self.inner.default_output_config(),
        };
        result.map_err(|e| classify_default_config_error(&self.name, e))
    }
}

fn classify_default_config_error(name: &str, err: cpal::DefaultStreamConfigError) -> AudioError {
    let reason = match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceFailure::Busy,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => DeviceFailure::NotFound,
        _ => DeviceFailure::Unknown,
    };
    AudioError::device(reason, format!("{}: {}", name, err))
}

/// List input and output devices of the default host
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            let config = device.default_input_config().ok();
            if let Ok(name) = device.name() {
                devices.push(AudioDeviceInfo {
                    id: format!("{}{}", Direction::Input.prefix(), name),
                    is_default: default_input.as_deref() == Some(name.as_str()),
                    is_input: true,
                    default_sample_rate: config.as_ref().map(|c| c.sample_rate().0),
                    default_channels: config.as_ref().map(|c| c.channels()),
                    name,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let config = device.default_output_config().ok();
            if let Ok(name) = device.name() {
                devices.push(AudioDeviceInfo {
                    id: format!("{}{}", Direction::Output.prefix(), name),
                    is_default: default_output.as_deref() == Some(name.as_str()),
                    is_input: false,
                    default_sample_rate: config.as_ref().map(|c| c.sample_rate().0),
                    default_channels: config.as_ref().map(|c| c.channels()),
                    name,
                });
            }
        }
    }

    devices
}

/// Resolve a device by id (`input:<name>` / `output:<name>` or a bare name),
/// falling back to the host default when no id is given
pub fn find_device(direction: Direction, id: Option<&str>) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device
            .map(|d| AudioDevice::new(d, direction))
            .ok_or_else(|| AudioError::device(DeviceFailure::NotFound, "no default device"));
    };

    let name = id.strip_prefix(direction.prefix()).unwrap_or(id);
    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::device(DeviceFailure::Unknown, e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(AudioDevice::new(device, direction));
        }
    }

    Err(AudioError::device(DeviceFailure::NotFound, id.to_string()))
}
