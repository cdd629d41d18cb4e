pub mod editor;
pub mod host;
pub mod instance;
pub mod interfaces;
pub mod midi;
pub mod module;
pub mod port;
pub mod processor;
pub mod state;
pub mod window;

pub use editor::{EditorHost, EditorState};
pub use host::{HostContext, PluginDescriptor, Vst3Host, classify};
pub use instance::PluginInstance;
pub use interfaces::{ComponentHandler, HostApplication};
pub use midi::{EventList, MidiEventKind};
pub use module::{ClassInfo, LibraryLoader, ModuleLoader, PluginModule};
pub use port::{BusInfo, ParameterInfo};
pub use processor::ProcessError;
pub use state::{MemoryStream, StateBlob};
pub use window::{NativeWindow, ResizeHandler};

use std::path::PathBuf;

pub fn default_vst3_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    #[cfg(target_os = "windows")]
    {
        roots.push(PathBuf::from(r"C:\Program Files\Common Files\VST3"));
        roots.push(PathBuf::from(r"C:\Program Files (x86)\Common Files\VST3"));
        if let Some(roaming) = std::env::var_os("APPDATA") {
            roots.push(PathBuf::from(roaming).join("VST3"));
        }
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            roots.push(PathBuf::from(local).join("Programs").join("Common").join("VST3"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        roots.push(PathBuf::from("/Library/Audio/Plug-Ins/VST3"));
        roots.push(PathBuf::from(format!(
            "{}/Library/Audio/Plug-Ins/VST3",
            home_dir()
        )));
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        roots.push(PathBuf::from("/usr/lib/vst3"));
        roots.push(PathBuf::from("/usr/lib64/vst3"));
        roots.push(PathBuf::from("/usr/local/lib/vst3"));
        roots.push(PathBuf::from("/usr/local/lib64/vst3"));
        roots.push(PathBuf::from(format!("{}/.vst3", home_dir())));
        roots.push(PathBuf::from(format!("{}/.local/lib/vst3", home_dir())));
    }

    roots
}

/// Directories listed in `VST3_PATH`, in order.
pub fn env_vst3_search_roots() -> Vec<PathBuf> {
    std::env::var_os("VST3_PATH")
        .map(|extra| {
            std::env::split_paths(&extra)
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(not(target_os = "windows"))]
fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default()
}
