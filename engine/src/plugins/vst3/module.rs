use super::interfaces::{extract_cstring, guid_to_tuid, tuid_to_hex};
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vst3::Steinberg::Vst::{IComponent, IEditController};
use vst3::Steinberg::{
    IPluginFactory, IPluginFactory2, IPluginFactory2Trait, IPluginFactoryTrait, PClassInfo,
    PClassInfo2, PFactoryInfo, TUID, kResultOk,
};
use vst3::{ComPtr, Interface};

/// Factory category of classes that implement `IComponent`.
pub const AUDIO_MODULE_CLASS: &str = "Audio Module Class";

#[cfg(all(unix, not(target_os = "macos")))]
const ENTRY_SYMBOL: &[u8] = b"ModuleEntry";
#[cfg(all(unix, not(target_os = "macos")))]
const EXIT_SYMBOL: &[u8] = b"ModuleExit";
#[cfg(target_os = "macos")]
const ENTRY_SYMBOL: &[u8] = b"bundleEntry";
#[cfg(target_os = "macos")]
const EXIT_SYMBOL: &[u8] = b"bundleExit";
#[cfg(windows)]
const ENTRY_SYMBOL: &[u8] = b"InitDll";
#[cfg(windows)]
const EXIT_SYMBOL: &[u8] = b"ExitDll";

type ExitFn = unsafe extern "C" fn() -> bool;
type GetFactoryFn = unsafe extern "system" fn() -> *mut IPluginFactory;

/// Information about a plugin class
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    pub cid: TUID,
    pub name: String,
    pub category: String,
    /// `|`-separated, empty unless the factory implements `IPluginFactory2`.
    pub sub_categories: String,
    pub vendor: String,
    pub version: String,
}

impl ClassInfo {
    pub fn is_audio_module(&self) -> bool {
        self.category == AUDIO_MODULE_CLASS
    }

    pub fn class_id(&self) -> String {
        tuid_to_hex(&self.cid)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FactoryInfo {
    pub vendor: String,
    pub url: String,
    pub email: String,
}

/// Opens plugin bundles. Replaceable so scans and loads can run against
/// in-process factories.
pub trait ModuleLoader: Send + Sync {
    fn open(&self, bundle: &Path) -> Result<PluginModule, String>;
}

/// Loads the platform binary inside a bundle with `libloading`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibraryLoader;

impl ModuleLoader for LibraryLoader {
    fn open(&self, bundle: &Path) -> Result<PluginModule, String> {
        PluginModule::load(bundle)
    }
}

/// A loaded plugin module and its class factory.
pub struct PluginModule {
    path: PathBuf,
    // Released before the exit entry runs and the library is unmapped.
    factory: ManuallyDrop<ComPtr<IPluginFactory>>,
    exit: Option<ExitFn>,
    library: Option<libloading::Library>,
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("path", &self.path)
            .field("factory", &"<COM ptr>")
            .field("library", &self.library.is_some())
            .finish()
    }
}

impl PluginModule {
    pub fn load(bundle: &Path) -> Result<Self, String> {
        let binary = module_binary_path(bundle)?;
        let (library, handle) = open_library(&binary)?;

        unsafe { call_module_entry(&library, handle, &binary)? };

        let exit = unsafe { library.get::<ExitFn>(EXIT_SYMBOL).ok().map(|symbol| *symbol) };

        let factory = unsafe {
            library
                .get::<GetFactoryFn>(b"GetPluginFactory")
                .ok()
                .and_then(|get_factory| ComPtr::from_raw(get_factory()))
        };
        let Some(factory) = factory else {
            if let Some(exit) = exit {
                unsafe { exit() };
            }
            return Err(format!(
                "Failed to obtain plugin factory from {}",
                binary.display()
            ));
        };

        debug!("Loaded VST3 module {}", binary.display());
        Ok(Self {
            path: bundle.to_path_buf(),
            factory: ManuallyDrop::new(factory),
            exit,
            library: Some(library),
        })
    }

    /// Wrap a factory that already lives in this process.
    pub fn from_factory(path: impl Into<PathBuf>, factory: ComPtr<IPluginFactory>) -> Self {
        Self {
            path: path.into(),
            factory: ManuallyDrop::new(factory),
            exit: None,
            library: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn factory(&self) -> &ComPtr<IPluginFactory> {
        &self.factory
    }

    pub fn factory_info(&self) -> Option<FactoryInfo> {
        let mut info: PFactoryInfo = unsafe { std::mem::zeroed() };
        let result = unsafe { self.factory.getFactoryInfo(&mut info) };
        (result == kResultOk).then(|| FactoryInfo {
            vendor: extract_cstring(&info.vendor),
            url: extract_cstring(&info.url),
            email: extract_cstring(&info.email),
        })
    }

    pub fn classes(&self) -> Vec<ClassInfo> {
        let count = unsafe { self.factory.countClasses() }.max(0);
        let factory2 = self.factory.cast::<IPluginFactory2>();
        (0..count)
            .filter_map(|index| match &factory2 {
                Some(factory2) => class_info2(factory2, index).or_else(|| self.class_info(index)),
                None => self.class_info(index),
            })
            .collect()
    }

    fn class_info(&self, index: i32) -> Option<ClassInfo> {
        let mut info: PClassInfo = unsafe { std::mem::zeroed() };
        let result = unsafe { self.factory.getClassInfo(index, &mut info) };
        if result != kResultOk {
            warn!("getClassInfo({index}) failed (result: {result})");
            return None;
        }
        Some(ClassInfo {
            cid: info.cid,
            name: extract_cstring(&info.name),
            category: extract_cstring(&info.category),
            sub_categories: String::new(),
            vendor: String::new(),
            version: String::new(),
        })
    }

    /// Instantiate `cid` and query it for `I`.
    pub fn create<I: Interface>(&self, cid: &TUID) -> Result<ComPtr<I>, String> {
        let iid = guid_to_tuid(&I::IID);
        let mut obj: *mut c_void = std::ptr::null_mut();
        let result = unsafe { self.factory.createInstance(cid.as_ptr(), iid.as_ptr(), &mut obj) };
        if result != kResultOk || obj.is_null() {
            return Err(format!(
                "Failed to create instance of class {} (result: {})",
                tuid_to_hex(cid),
                result
            ));
        }
        unsafe { ComPtr::from_raw(obj as *mut I) }
            .ok_or_else(|| format!("createInstance returned null for {}", tuid_to_hex(cid)))
    }

    pub fn create_component(&self, cid: &TUID) -> Result<ComPtr<IComponent>, String> {
        self.create::<IComponent>(cid)
    }

    pub fn create_controller(&self, cid: &TUID) -> Result<ComPtr<IEditController>, String> {
        self.create::<IEditController>(cid)
    }
}

impl Drop for PluginModule {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.factory) };
        if let Some(exit) = self.exit.take() {
            if !unsafe { exit() } {
                warn!("Module exit failed for {}", self.path.display());
            }
        }
        // `library` is dropped after this, unmapping the binary.
    }
}

fn class_info2(factory: &ComPtr<IPluginFactory2>, index: i32) -> Option<ClassInfo> {
    let mut info: PClassInfo2 = unsafe { std::mem::zeroed() };
    let result = unsafe { factory.getClassInfo2(index, &mut info) };
    if result != kResultOk {
        return None;
    }
    Some(ClassInfo {
        cid: info.cid,
        name: extract_cstring(&info.name),
        category: extract_cstring(&info.category),
        sub_categories: extract_cstring(&info.subCategories),
        vendor: extract_cstring(&info.vendor),
        version: extract_cstring(&info.version),
    })
}

#[cfg(not(windows))]
unsafe fn call_module_entry(
    library: &libloading::Library,
    handle: *mut c_void,
    binary: &Path,
) -> Result<(), String> {
    match unsafe { library.get::<unsafe extern "C" fn(*mut c_void) -> bool>(ENTRY_SYMBOL) } {
        Ok(entry) if unsafe { entry(handle) } => Ok(()),
        Ok(_) => Err(format!("Module entry returned false for {}", binary.display())),
        Err(_) => {
            debug!("{} exports no module entry", binary.display());
            Ok(())
        }
    }
}

// Many Windows plugins rely on InitDll to set up module globals used for
// resource lookup and UI.
#[cfg(windows)]
unsafe fn call_module_entry(
    library: &libloading::Library,
    _handle: *mut c_void,
    binary: &Path,
) -> Result<(), String> {
    match unsafe { library.get::<unsafe extern "C" fn() -> bool>(ENTRY_SYMBOL) } {
        Ok(init) if unsafe { init() } => Ok(()),
        Ok(_) => Err(format!("InitDll returned false for {}", binary.display())),
        Err(_) => {
            debug!("{} exports no InitDll", binary.display());
            Ok(())
        }
    }
}

#[cfg(unix)]
fn open_library(binary: &Path) -> Result<(libloading::Library, *mut c_void), String> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};

    let library = unsafe { Library::open(Some(binary), RTLD_NOW | RTLD_LOCAL) }
        .map_err(|e| format!("Failed to load VST3 module {:?}: {}", binary, e))?;
    let handle = library.into_raw();
    let library = unsafe { Library::from_raw(handle) };
    // The Linux entry point receives the dlopen handle; macOS expects a
    // CFBundleRef, which is not available here.
    #[cfg(target_os = "macos")]
    let handle = std::ptr::null_mut();
    Ok((library.into(), handle))
}

#[cfg(windows)]
fn open_library(binary: &Path) -> Result<(libloading::Library, *mut c_void), String> {
    let library = unsafe { libloading::Library::new(binary) }
        .map_err(|e| format!("Failed to load VST3 module {:?}: {}", binary, e))?;
    Ok((library, std::ptr::null_mut()))
}

fn bundle_stem(bundle: &Path) -> String {
    bundle
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("plugin")
        .to_string()
}

/// Architecture folder name used inside `Contents/`.
pub fn bundle_arch_dir() -> &'static str {
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        match std::env::consts::ARCH {
            "x86" => "i386-linux",
            "aarch64" => "aarch64-linux",
            "arm" => "armv7l-linux",
            _ => "x86_64-linux",
        }
    }
    #[cfg(target_os = "macos")]
    {
        "MacOS"
    }
    #[cfg(windows)]
    {
        match std::env::consts::ARCH {
            "x86" => "x86-win",
            "aarch64" => "arm64-win",
            _ => "x86_64-win",
        }
    }
}

/// Get the actual module path from a VST3 bundle path
pub fn module_binary_path(bundle: &Path) -> Result<PathBuf, String> {
    if bundle.is_file() {
        return Ok(bundle.to_path_buf());
    }
    let stem = bundle_stem(bundle);
    let contents = bundle.join("Contents").join(bundle_arch_dir());

    #[cfg(all(unix, not(target_os = "macos")))]
    let module = contents.join(format!("{stem}.so"));
    #[cfg(target_os = "macos")]
    let module = contents.join(&stem);
    #[cfg(windows)]
    let module = contents.join(format!("{stem}.vst3"));

    if module.exists() {
        Ok(module)
    } else {
        Err(format!("VST3 module not found at {:?}", module))
    }
}
