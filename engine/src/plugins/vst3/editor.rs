use super::window::{NativeWindow, ResizeHandler, default_resize_handler};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};
use vst3::Steinberg::Vst::{IEditController, IEditControllerTrait, ViewType};
use vst3::Steinberg::{
    IPlugFrame, IPlugFrameTrait, IPlugView, IPlugViewTrait, ViewRect, kInvalidArgument,
    kResultFalse, kResultOk, tresult,
};
use vst3::{Class, ComPtr, ComRef, ComWrapper};

#[cfg(all(unix, not(target_os = "macos")))]
use std::cell::RefCell;
#[cfg(all(unix, not(target_os = "macos")))]
use std::time::{Duration, Instant};
#[cfg(all(unix, not(target_os = "macos")))]
use vst3::Steinberg::Linux::{
    FileDescriptor, IEventHandler, IEventHandlerTrait, IRunLoop, IRunLoopTrait, ITimerHandler,
    ITimerHandlerTrait, TimerInterval,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditorState {
    NoView,
    ViewCreated,
    Attached,
}

fn rect_size(rect: &ViewRect) -> (i32, i32) {
    (rect.right - rect.left, rect.bottom - rect.top)
}

/// Native editor of one plugin instance.
///
/// All methods must run on the UI thread that opened the view; attach,
/// detach and close check this.
pub struct EditorHost {
    // Released before the frame so the view never outlives its frame.
    view: Option<ComPtr<IPlugView>>,
    frame: Option<ComWrapper<PlugFrame>>,
    parent: Option<NativeWindow>,
    ui_thread: Option<ThreadId>,
    resize: SharedResizeHandler,
}

type SharedResizeHandler = Arc<Mutex<Option<ResizeHandler>>>;

impl Default for EditorHost {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorHost {
    pub fn new() -> Self {
        Self {
            view: None,
            frame: None,
            parent: None,
            ui_thread: None,
            resize: Arc::new(Mutex::new(default_resize_handler())),
        }
    }

    pub fn state(&self) -> EditorState {
        match (&self.view, &self.parent) {
            (None, _) => EditorState::NoView,
            (Some(_), None) => EditorState::ViewCreated,
            (Some(_), Some(_)) => EditorState::Attached,
        }
    }

    pub fn is_open(&self) -> bool {
        self.view.is_some()
    }

    pub fn parent(&self) -> Option<NativeWindow> {
        self.parent
    }

    /// Replace the routine that resizes the parent region.
    pub fn set_resize_handler(&mut self, handler: ResizeHandler) {
        let mut slot = match self.resize.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handler);
    }

    /// Whether the controller can produce an editor. Probes by creating a
    /// view and releasing it straight away.
    pub fn has_editor(&self, controller: Option<&ComPtr<IEditController>>) -> bool {
        if self.view.is_some() {
            return true;
        }
        controller.and_then(create_view).is_some()
    }

    pub fn open(&mut self, controller: Option<&ComPtr<IEditController>>) -> Result<(), String> {
        if self.view.is_some() {
            return Ok(());
        }
        let controller = controller.ok_or("Plugin has no edit controller")?;
        let view = create_view(controller).ok_or("Plugin does not provide an editor view")?;
        self.view = Some(view);
        self.ui_thread = Some(thread::current().id());
        debug!("VST3 editor view created");
        Ok(())
    }

    pub fn attach(&mut self, window: NativeWindow) -> Result<(), String> {
        let Some(view) = self.view.clone() else {
            return Err("Editor is not open; call open_editor before attach_editor".to_string());
        };
        self.check_thread("attach")?;
        if window.is_null() {
            return Err("Cannot attach editor to a null window handle".to_string());
        }
        if self.parent.is_some() {
            self.detach_view(&view);
        }

        let supported = unsafe { view.isPlatformTypeSupported(window.platform_type()) };
        if supported != kResultOk {
            return Err(format!(
                "Editor does not support {} windows (result: {})",
                window.platform_name(),
                supported
            ));
        }

        // The frame must be in place before `attached`: some plugins resize
        // from inside it.
        let frame = ComWrapper::new(PlugFrame::new(self.resize.clone()));
        frame.parent.set(Some(window));
        let frame_ptr = frame
            .as_com_ref::<IPlugFrame>()
            .map(|r| r.as_ptr())
            .ok_or("Failed to create editor frame")?;
        unsafe { view.setFrame(frame_ptr) };

        // Native exceptions thrown by the plugin here cannot be caught
        // in-process; only the result code is checked.
        let result = unsafe { view.attached(window.as_ptr(), window.platform_type()) };
        if result != kResultOk {
            unsafe { view.setFrame(std::ptr::null_mut()) };
            return Err(format!("VST3 editor attach failed (result: {result})"));
        }
        debug!("VST3 editor attached to {:?}", window);
        self.frame = Some(frame);
        self.parent = Some(window);
        Ok(())
    }

    /// Detach from the parent window, keeping the view.
    pub fn detach(&mut self) -> Result<(), String> {
        let Some(view) = self.view.clone() else {
            return Ok(());
        };
        if self.parent.is_none() {
            return Ok(());
        }
        self.check_thread("detach")?;
        self.detach_view(&view);
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), String> {
        if self.view.is_none() {
            return Ok(());
        }
        self.check_thread("close")?;
        self.release();
        Ok(())
    }

    /// Close regardless of thread. Used by instance teardown, which must
    /// release the view before the module goes away.
    pub(crate) fn force_close(&mut self) {
        if self.view.is_none() {
            return;
        }
        if self.check_thread("close").is_err() {
            warn!("Closing VST3 editor off its UI thread");
        }
        self.release();
    }

    pub fn size(&self) -> Option<(i32, i32)> {
        let view = self.view.as_ref()?;
        let mut rect = ViewRect {
            left: 0,
            top: 0,
            right: 0,
            bottom: 0,
        };
        let result = unsafe { view.getSize(&mut rect) };
        (result == kResultOk).then(|| rect_size(&rect))
    }

    /// Run plugin-registered timers and fd handlers. Call regularly from
    /// the UI loop while the editor is attached.
    pub fn idle(&self) {
        if let Some(frame) = &self.frame {
            frame.idle();
        }
    }

    fn check_thread(&self, operation: &str) -> Result<(), String> {
        match self.ui_thread {
            Some(id) if id != thread::current().id() => Err(format!(
                "Editor {operation} must run on the thread that opened the editor"
            )),
            _ => Ok(()),
        }
    }

    fn detach_view(&mut self, view: &ComPtr<IPlugView>) {
        unsafe {
            view.setFrame(std::ptr::null_mut());
            view.removed();
        }
        self.frame = None;
        self.parent = None;
    }

    fn release(&mut self) {
        if let Some(view) = self.view.take() {
            if self.parent.is_some() {
                self.detach_view(&view);
            } else {
                unsafe { view.setFrame(std::ptr::null_mut()) };
            }
        }
        self.frame = None;
        self.parent = None;
        self.ui_thread = None;
        debug!("VST3 editor closed");
    }
}

fn create_view(controller: &ComPtr<IEditController>) -> Option<ComPtr<IPlugView>> {
    let view = unsafe { controller.createView(ViewType::kEditor) };
    unsafe { ComPtr::from_raw(view) }
}

#[cfg(all(unix, not(target_os = "macos")))]
struct Timer {
    handler: ComPtr<ITimerHandler>,
    interval: Duration,
    next_tick: Instant,
}

/// Host frame handed to the view: resize negotiation, plus the Linux run
/// loop plugins use for timers and fd callbacks.
pub struct PlugFrame {
    parent: Cell<Option<NativeWindow>>,
    resize: SharedResizeHandler,
    in_resize: Cell<bool>,
    #[cfg(all(unix, not(target_os = "macos")))]
    event_handlers: RefCell<Vec<(ComPtr<IEventHandler>, FileDescriptor)>>,
    #[cfg(all(unix, not(target_os = "macos")))]
    timers: RefCell<Vec<Timer>>,
}

impl PlugFrame {
    fn new(resize: SharedResizeHandler) -> Self {
        Self {
            parent: Cell::new(None),
            resize,
            in_resize: Cell::new(false),
            #[cfg(all(unix, not(target_os = "macos")))]
            event_handlers: RefCell::new(Vec::new()),
            #[cfg(all(unix, not(target_os = "macos")))]
            timers: RefCell::new(Vec::new()),
        }
    }

    fn resize_parent(&self, width: i32, height: i32) {
        let Some(parent) = self.parent.get() else {
            return;
        };
        let mut handler = match self.resize.try_lock() {
            Ok(handler) => handler,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if let Some(handler) = handler.as_mut() {
            if !handler(parent, width, height) {
                debug!("Parent window not resized to {}x{}", width, height);
            }
        }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn idle(&self) {
        // Handlers may unregister themselves from inside the callback.
        let events: Vec<_> = self.event_handlers.borrow().clone();
        for (handler, fd) in events {
            unsafe { handler.onFDIsSet(fd) };
        }

        let now = Instant::now();
        let due: Vec<_> = self
            .timers
            .borrow_mut()
            .iter_mut()
            .filter(|timer| now >= timer.next_tick)
            .map(|timer| {
                timer.next_tick = now + timer.interval;
                timer.handler.clone()
            })
            .collect();
        for handler in due {
            unsafe { handler.onTimer() };
        }
    }

    #[cfg(not(all(unix, not(target_os = "macos"))))]
    fn idle(&self) {}

    #[cfg(all(unix, not(target_os = "macos")))]
    pub fn registered_timers(&self) -> usize {
        self.timers.borrow().len()
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
impl Class for PlugFrame {
    type Interfaces = (IPlugFrame, IRunLoop);
}

#[cfg(not(all(unix, not(target_os = "macos"))))]
impl Class for PlugFrame {
    type Interfaces = (IPlugFrame,);
}

impl IPlugFrameTrait for PlugFrame {
    unsafe fn resizeView(&self, view: *mut IPlugView, new_size: *mut ViewRect) -> tresult {
        if view.is_null() || new_size.is_null() {
            return kInvalidArgument;
        }
        if self.in_resize.get() {
            return kResultFalse;
        }
        self.in_resize.set(true);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let requested = unsafe { *new_size };
            let (width, height) = rect_size(&requested);
            debug!("VST3 editor requested resize to {}x{}", width, height);
            self.resize_parent(width, height);

            let Some(view) = (unsafe { ComRef::from_raw(view) }) else {
                return;
            };
            let mut current = ViewRect {
                left: 0,
                top: 0,
                right: 0,
                bottom: 0,
            };
            if unsafe { view.getSize(&mut current) } == kResultOk
                && rect_size(&current) != (width, height)
            {
                unsafe { view.onSize(new_size) };
            }
        }));

        self.in_resize.set(false);
        match outcome {
            Ok(()) => kResultOk,
            Err(_) => {
                warn!("Panic while handling VST3 editor resize");
                kResultFalse
            }
        }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
impl IRunLoopTrait for PlugFrame {
    unsafe fn registerEventHandler(
        &self,
        handler: *mut IEventHandler,
        fd: FileDescriptor,
    ) -> tresult {
        let Some(handler) = (unsafe { ComRef::from_raw(handler) }) else {
            return kInvalidArgument;
        };
        self.event_handlers
            .borrow_mut()
            .push((handler.to_com_ptr(), fd));
        kResultOk
    }

    unsafe fn unregisterEventHandler(&self, handler: *mut IEventHandler) -> tresult {
        if handler.is_null() {
            return kInvalidArgument;
        }
        self.event_handlers
            .borrow_mut()
            .retain(|(registered, _)| registered.as_ptr() != handler);
        kResultOk
    }

    unsafe fn registerTimer(&self, handler: *mut ITimerHandler, milliseconds: TimerInterval) -> tresult {
        let Some(handler) = (unsafe { ComRef::from_raw(handler) }) else {
            return kInvalidArgument;
        };
        let interval = Duration::from_millis(milliseconds.max(1));
        self.timers.borrow_mut().push(Timer {
            handler: handler.to_com_ptr(),
            interval,
            next_tick: Instant::now() + interval,
        });
        kResultOk
    }

    unsafe fn unregisterTimer(&self, handler: *mut ITimerHandler) -> tresult {
        if handler.is_null() {
            return kInvalidArgument;
        }
        self.timers
            .borrow_mut()
            .retain(|timer| timer.handler.as_ptr() != handler);
        kResultOk
    }
}
