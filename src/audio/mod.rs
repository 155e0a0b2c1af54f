//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod output;

pub use buffer::AudioBuffer;
pub use device::{get_output_device, list_output_devices, AudioDevice, OutputDeviceInfo, OutputFormat};
pub use output::{AudioOutput, CpalOutput};
