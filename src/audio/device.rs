//! Output device enumeration and lookup
//!
//! Devices are addressed by string identifiers of the form `output:<name>`.
//! The bare name and the literal `default` are also accepted. Choosing which
//! participant gets which device is the launcher's job; this module only
//! resolves the identifier it hands over.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Identifier that selects the host's default output device
pub const DEFAULT_DEVICE_ID: &str = "default";

/// Description of one output device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Rate and channel count a stream is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One supported configuration range, detached from cpal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FormatRange {
    pub is_f32: bool,
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
}

impl FormatRange {
    fn contains(&self, rate: u32) -> bool {
        (self.min_rate..=self.max_rate).contains(&rate)
    }
}

/// Pick an f32 format, keeping the device default where it is supported.
///
/// The default rate wins over the default channel count; failing both, the
/// first f32 range is used with the default rate clamped into it.
pub(crate) fn select_f32_format(ranges: &[FormatRange], preferred: OutputFormat) -> Option<OutputFormat> {
    let f32_ranges = || ranges.iter().filter(|r| r.is_f32);

    if f32_ranges().any(|r| r.channels == preferred.channels && r.contains(preferred.sample_rate)) {
        return Some(preferred);
    }
    if let Some(range) = f32_ranges().find(|r| r.contains(preferred.sample_rate)) {
        return Some(OutputFormat {
            sample_rate: preferred.sample_rate,
            channels: range.channels,
        });
    }
    f32_ranges().next().map(|range| OutputFormat {
        sample_rate: preferred.sample_rate.clamp(range.min_rate, range.max_rate),
        channels: range.channels,
    })
}

/// Wrapper around a cpal output device
pub struct AudioDevice {
    inner: cpal::Device,
    pub id: String,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            id: device_id(&name),
            inner: device,
            name,
        }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Get default output config
    pub fn default_output_config(&self) -> Result<cpal::SupportedStreamConfig, AudioError> {
        self.inner
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(format!("{}: {}", self.id, e)))
    }

    /// Format playback streams use on this device; fails when the device
    /// cannot take f32 samples at all
    pub fn f32_output_format(&self) -> Result<OutputFormat, AudioError> {
        let default = self.default_output_config()?;
        let preferred = OutputFormat {
            sample_rate: default.sample_rate().0,
            channels: default.channels(),
        };
        let ranges: Vec<FormatRange> = self
            .inner
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedFormat(format!("{}: {}", self.id, e)))?
            .map(|config| FormatRange {
                is_f32: config.sample_format() == cpal::SampleFormat::F32,
                channels: config.channels(),
                min_rate: config.min_sample_rate().0,
                max_rate: config.max_sample_rate().0,
            })
            .collect();

        select_f32_format(&ranges, preferred).ok_or_else(|| {
            AudioError::UnsupportedFormat(format!("{} has no f32 output configuration", self.id))
        })
    }
}

/// Build the identifier for a device name
pub fn device_id(name: &str) -> String {
    format!("output:{}", name)
}

/// List all available output devices
pub fn list_output_devices() -> Vec<OutputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = get_device_capabilities(&device);
            devices.push(OutputDeviceInfo {
                id: device_id(&name),
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                sample_rates,
                channels,
            });
        }
    }
    devices
}

fn get_device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            for rate_val in [44100u32, 48000, 88200, 96000, 176400, 192000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !sample_rates.contains(&rate_val)
                {
                    sample_rates.push(rate_val);
                }
            }
            let ch = config.channels();
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Resolve an output device by identifier
pub fn get_output_device(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    if id == DEFAULT_DEVICE_ID {
        return host
            .default_output_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()));
    }

    let name = id.strip_prefix("output:").unwrap_or(id);
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(AudioDevice::from_cpal(device));
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}
