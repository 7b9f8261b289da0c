//! Audio subsystem module

pub mod capture;
pub mod device;
pub mod framer;
pub mod output;
pub mod pipeline;
pub mod playback;
pub mod resampler;

pub use capture::{CaptureBackend, CaptureConstraints, CpalCapture};
pub use device::{find_device, list_devices, AudioDevice, AudioDeviceInfo};
pub use framer::Framer;
pub use output::CpalOutputFactory;
pub use playback::{PlaybackScheduler, RenderContext, RenderContextFactory};
