use super::instance::PluginInstance;
use super::interfaces::{ComponentHandler, HostApplication};
use super::module::{ClassInfo, LibraryLoader, ModuleLoader};
use super::{default_vst3_search_roots, env_vst3_search_roots};
use crate::config::HostConfig;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use vst3::Steinberg::FUnknown;
use vst3::Steinberg::Vst::IComponentHandler;
use vst3::{ComPtr, ComWrapper};

const INSTRUMENT_KEYWORDS: &[&str] = &[
    "instrument",
    "synth",
    "sampler",
    "drum",
    "piano",
    "soundgenerator",
    "generator",
];
const EFFECT_KEYWORDS: &[&str] = &["fx", "effect"];

/// A discovered, not yet loaded, plugin class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub vendor: String,
    /// Raw `|`-separated sub-category string.
    pub category: String,
    pub path: String, // Path to .vst3 bundle
    pub class_id: String,
    pub version: String,
    pub is_instrument: bool,
    pub is_effect: bool,
}

impl PluginDescriptor {
    pub fn from_class(bundle: &Path, factory_vendor: &str, class: &ClassInfo) -> Self {
        let (is_instrument, is_effect) = classify(&class.name, &class.sub_categories);
        let vendor = if class.vendor.is_empty() {
            factory_vendor.to_string()
        } else {
            class.vendor.clone()
        };
        Self {
            name: class.name.clone(),
            vendor,
            category: class.sub_categories.clone(),
            path: bundle.to_string_lossy().to_string(),
            class_id: class.class_id(),
            version: class.version.clone(),
            is_instrument,
            is_effect,
        }
    }
}

/// Instrument/effect heuristic, returns `(is_instrument, is_effect)`.
///
/// Sub-category keywords are matched case-insensitively. An "FX" marker in
/// the display name wins over sub-categories, since bundles often ship an
/// instrument and its "X FX" sibling. With no signal at all the class is
/// treated as an instrument.
pub fn classify(name: &str, sub_categories: &str) -> (bool, bool) {
    let sub = sub_categories.to_lowercase();
    let mut is_instrument = INSTRUMENT_KEYWORDS.iter().any(|k| sub.contains(k));
    let mut is_effect = EFFECT_KEYWORDS.iter().any(|k| sub.contains(k));

    if name.to_uppercase().contains("FX") {
        is_effect = true;
        is_instrument = false;
    }

    if !is_instrument && !is_effect {
        is_instrument = true;
    }
    (is_instrument, is_effect)
}

/// Bytes kept of the last error message.
pub const LAST_ERROR_LIMIT: usize = 256;

/// Process-lifetime objects shared by every plugin instance.
pub struct HostContext {
    application: ComWrapper<HostApplication>,
    handler: ComWrapper<ComponentHandler>,
    last_error: Mutex<String>,
}

// The COM wrappers are reference counted atomically and the objects behind
// them only hold atomics and mutexes.
unsafe impl Send for HostContext {}
unsafe impl Sync for HostContext {}

impl HostContext {
    pub fn new(host_name: &str) -> Self {
        Self {
            application: ComWrapper::new(HostApplication::new(host_name)),
            handler: ComWrapper::new(ComponentHandler::new()),
            last_error: Mutex::new(String::with_capacity(LAST_ERROR_LIMIT)),
        }
    }

    pub fn application(&self) -> Option<ComPtr<FUnknown>> {
        self.application.to_com_ptr::<FUnknown>()
    }

    pub fn component_handler(&self) -> Option<ComPtr<IComponentHandler>> {
        self.handler.to_com_ptr::<IComponentHandler>()
    }

    pub fn handler(&self) -> &ComponentHandler {
        &self.handler
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Store `message` as the last error and hand it back for propagation.
    /// The stored copy is truncated to `LAST_ERROR_LIMIT` bytes.
    pub fn record_error(&self, message: impl Into<String>) -> String {
        let message = message.into();
        if let Ok(mut slot) = self.last_error.lock() {
            slot.clear();
            let _ = BoundedWriter(&mut *slot).write_str(&message);
        }
        message
    }

    /// Non-blocking variant for the audio thread. Drops the message if the
    /// slot is contended and never grows the buffer.
    pub fn try_record_error(&self, error: &dyn fmt::Display) {
        if let Ok(mut slot) = self.last_error.try_lock() {
            slot.clear();
            let _ = write!(BoundedWriter(&mut *slot), "{error}");
        }
    }
}

/// Writes into a `String` up to `LAST_ERROR_LIMIT` bytes, truncating the
/// rest. The buffer is preallocated, so this never allocates.
struct BoundedWriter<'a>(&'a mut String);

impl fmt::Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LAST_ERROR_LIMIT.saturating_sub(self.0.len());
        let mut end = s.len().min(room);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.0.push_str(&s[..end]);
        Ok(())
    }
}

/// Entry point of the plugin host: scanning, loading and shared state.
pub struct Vst3Host {
    config: HostConfig,
    loader: Box<dyn ModuleLoader>,
    context: Arc<HostContext>,
}

impl Vst3Host {
    pub fn new(config: HostConfig) -> Self {
        Self::with_loader(config, Box::new(LibraryLoader))
    }

    pub fn with_loader(config: HostConfig, loader: Box<dyn ModuleLoader>) -> Self {
        info!("VST3 host '{}' starting", config.host_name);
        let context = Arc::new(HostContext::new(&config.host_name));
        Self {
            config,
            loader,
            context,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.context
    }

    pub(crate) fn loader(&self) -> &dyn ModuleLoader {
        self.loader.as_ref()
    }

    /// Message of the most recent failure on this host or any of its
    /// instances.
    pub fn last_error(&self) -> String {
        self.context.last_error()
    }

    /// Restart flags requested by any controller since the last call.
    ///
    /// The flags are OR-ed into one host-wide word and do not record which
    /// instance asked. Callers driving several instances must pass them to
    /// `handle_restart` on every instance.
    pub fn take_restart_flags(&self) -> i32 {
        self.context.handler().take_restart_flags()
    }

    pub fn load(&self, path: &Path) -> Result<PluginInstance, String> {
        PluginInstance::load(self, path)
    }

    /// Scan `directory` recursively, reporting every audio module class to
    /// `visitor`. Returns the number of descriptors emitted.
    pub fn scan<F>(&self, directory: &Path, mut visitor: F) -> usize
    where
        F: FnMut(PluginDescriptor),
    {
        if !directory.is_dir() {
            self.context
                .record_error(format!("Directory not found: {}", directory.display()));
            return 0;
        }

        let mut count = 0;
        for bundle in find_vst3_bundles(directory) {
            let module = match self.loader.open(&bundle) {
                Ok(module) => module,
                Err(e) => {
                    warn!("Skipping {}: {}", bundle.display(), e);
                    self.context.record_error(e);
                    continue;
                }
            };
            let vendor = module.factory_info().map(|i| i.vendor).unwrap_or_default();
            for class in module.classes().iter().filter(|c| c.is_audio_module()) {
                let descriptor = PluginDescriptor::from_class(&bundle, &vendor, class);
                debug!(
                    "VST3 plugin '{}' | SubCat: '{}' | instrument: {} | effect: {}",
                    descriptor.name,
                    descriptor.category,
                    descriptor.is_instrument,
                    descriptor.is_effect
                );
                visitor(descriptor);
                count += 1;
            }
        }
        info!("Scanned {}: {} plugin(s)", directory.display(), count);
        count
    }

    /// Directories scanned by `scan_standard_locations`, deduplicated.
    pub fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots = default_vst3_search_roots();
        roots.extend(env_vst3_search_roots());
        roots.extend(self.config.extra_search_paths.iter().cloned());

        let mut seen = std::collections::HashSet::new();
        roots.retain(|root| seen.insert(root.clone()));
        roots
    }

    pub fn scan_standard_locations<F>(&self, mut visitor: F) -> usize
    where
        F: FnMut(PluginDescriptor),
    {
        self.search_roots()
            .iter()
            .filter(|root| root.is_dir())
            .map(|root| self.scan(root, &mut visitor))
            .sum()
    }
}

/// Collect `.vst3` bundles under `root` in sorted order without descending
/// into the bundles themselves.
pub fn find_vst3_bundles(root: &Path) -> Vec<PathBuf> {
    let mut bundles = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(ft) = entry.file_type() else {
                continue;
            };
            let is_bundle = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("vst3"));
            if is_bundle && (ft.is_dir() || (cfg!(windows) && ft.is_file())) {
                bundles.push(path);
            } else if ft.is_dir() {
                stack.push(path);
            }
        }
    }
    bundles.sort();
    bundles
}
