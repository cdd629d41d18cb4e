use std::ffi::c_void;
use vst3::Steinberg::{
    FIDString, kPlatformTypeHWND, kPlatformTypeNSView, kPlatformTypeX11EmbedWindowID,
};

/// Host-owned native window region an editor view is embedded into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeWindow {
    X11(u64),
    Hwnd(*mut c_void),
    NsView(*mut c_void),
}

// Handles are opaque identifiers; only the plugin and the platform resizers
// dereference them, on the UI thread.
unsafe impl Send for NativeWindow {}

impl NativeWindow {
    pub fn platform_type(&self) -> FIDString {
        match self {
            Self::X11(_) => kPlatformTypeX11EmbedWindowID,
            Self::Hwnd(_) => kPlatformTypeHWND,
            Self::NsView(_) => kPlatformTypeNSView,
        }
    }

    pub fn platform_name(&self) -> &'static str {
        match self {
            Self::X11(_) => "X11EmbedWindowID",
            Self::Hwnd(_) => "HWND",
            Self::NsView(_) => "NSView",
        }
    }

    /// Value passed to `IPlugView::attached`.
    pub fn as_ptr(&self) -> *mut c_void {
        match *self {
            Self::X11(window) => window as usize as *mut c_void,
            Self::Hwnd(ptr) | Self::NsView(ptr) => ptr,
        }
    }

    pub fn is_null(&self) -> bool {
        self.as_ptr().is_null()
    }
}

/// Resizes the host's parent region to `(width, height)` on behalf of a
/// plugin view. Returns whether the region was resized.
pub type ResizeHandler = Box<dyn FnMut(NativeWindow, i32, i32) -> bool + Send>;

/// Platform resizer for the window kinds this build can drive directly.
/// `None` where no native resizer exists (NSView); install one with
/// `EditorHost::set_resize_handler` there.
pub fn default_resize_handler() -> Option<ResizeHandler> {
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        let mut resizer = x11::X11Resizer::default();
        Some(Box::new(move |window, width, height| match window {
            NativeWindow::X11(id) => resizer.resize(id, width, height),
            _ => false,
        }))
    }
    #[cfg(windows)]
    {
        Some(Box::new(|window, width, height| match window {
            NativeWindow::Hwnd(hwnd) => win32::resize(hwnd, width, height),
            _ => false,
        }))
    }
    #[cfg(target_os = "macos")]
    {
        None
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
mod x11 {
    use std::os::raw::c_uint;
    use tracing::warn;
    use x11_dl::xlib;

    /// Lazily opens its own display connection on first resize.
    #[derive(Default)]
    pub struct X11Resizer {
        xlib: Option<xlib::Xlib>,
        display: Option<*mut xlib::Display>,
    }

    // The display connection belongs to this resizer alone.
    unsafe impl Send for X11Resizer {}

    impl X11Resizer {
        pub fn resize(&mut self, window: u64, width: i32, height: i32) -> bool {
            if window == 0 {
                return false;
            }
            let Some(display) = self.display() else {
                return false;
            };
            let Some(xlib) = self.xlib.as_ref() else {
                return false;
            };
            unsafe {
                (xlib.XResizeWindow)(
                    display,
                    window as xlib::Window,
                    width.max(1) as c_uint,
                    height.max(1) as c_uint,
                );
                (xlib.XFlush)(display);
            }
            true
        }

        fn display(&mut self) -> Option<*mut xlib::Display> {
            if let Some(display) = self.display {
                return Some(display);
            }
            if self.xlib.is_none() {
                match xlib::Xlib::open() {
                    Ok(lib) => self.xlib = Some(lib),
                    Err(e) => {
                        warn!("Failed to load Xlib: {e}");
                        return None;
                    }
                }
            }
            let xlib = self.xlib.as_ref()?;
            let display = unsafe { (xlib.XOpenDisplay)(std::ptr::null()) };
            if display.is_null() {
                warn!("Failed to open X11 display for editor resize");
                return None;
            }
            self.display = Some(display);
            Some(display)
        }
    }

    impl Drop for X11Resizer {
        fn drop(&mut self) {
            if let (Some(xlib), Some(display)) = (self.xlib.as_ref(), self.display.take()) {
                unsafe { (xlib.XCloseDisplay)(display) };
            }
        }
    }
}

#[cfg(windows)]
mod win32 {
    use std::ffi::c_void;
    use windows_sys::Win32::UI::WindowsAndMessaging::MoveWindow;

    pub fn resize(hwnd: *mut c_void, width: i32, height: i32) -> bool {
        if hwnd.is_null() {
            return false;
        }
        unsafe { MoveWindow(hwnd as _, 0, 0, width.max(1), height.max(1), 1) != 0 }
    }
}
