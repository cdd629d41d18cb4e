pub mod config;
pub mod plugins;

pub use config::HostConfig;
pub use plugins::vst3::{PluginDescriptor, PluginInstance, Vst3Host};
