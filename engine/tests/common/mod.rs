//! In-process mock plugin used by the integration tests.
//!
//! One factory serves a component (`IComponent` + `IAudioProcessor` +
//! `IConnectionPoint`), a separate controller (`IEditController` +
//! `IConnectionPoint`) and an editor view. Both halves share a `Shared`
//! record the tests inspect.

#![allow(dead_code, non_snake_case)]

use byteorder::{ByteOrder, LittleEndian};
use plughost_engine::HostConfig;
use plughost_engine::plugins::vst3::interfaces::guid_to_tuid;
use plughost_engine::plugins::vst3::{ModuleLoader, PluginModule, Vst3Host};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use vst3::Steinberg::Vst::BusDirections_::{kInput, kOutput};
use vst3::Steinberg::Vst::BusInfo_::BusFlags_::kDefaultActive;
use vst3::Steinberg::Vst::Event_::EventTypes_::{kNoteOffEvent, kNoteOnEvent};
use vst3::Steinberg::Vst::MediaTypes_::{kAudio, kEvent};
use vst3::Steinberg::Vst::{
    BusDirection, BusInfo, Event, IAttributeListTrait, IAudioProcessor, IAudioProcessorTrait,
    IComponent, IComponentHandler, IComponentHandlerTrait, IComponentTrait, IConnectionPoint,
    IConnectionPointTrait, IEditController, IEditControllerTrait, IEventListTrait,
    IHostApplication, IHostApplicationTrait, IMessage, IMessageTrait, IParamValueQueueTrait,
    IParameterChangesTrait, IoMode, MediaType, ParamID, ParamValue, ParameterInfo, ProcessData,
    ProcessSetup, RoutingInfo, SpeakerArrangement, String128, TChar,
};
use vst3::Steinberg::{
    FIDString, FUnknown, IBStream, IBStreamTrait, IPlugFrame, IPlugFrameTrait, IPlugView,
    IPlugViewTrait, IPluginBaseTrait, IPluginFactory, IPluginFactory2, IPluginFactory2Trait,
    IPluginFactoryTrait, PClassInfo, PClassInfo2, PFactoryInfo, TBool, TUID, ViewRect, char16,
    int16, kInvalidArgument, kResultFalse, kResultOk, tresult,
};
use vst3::{Class, ComPtr, ComRef, ComWrapper, Interface};

pub const COMPONENT_CID: TUID = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
pub const CONTROLLER_CID: TUID = [16, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1];

pub const GAIN_ID: ParamID = 0;
pub const MODE_ID: ParamID = 1;
pub const DEFAULT_GAIN: f64 = 0.5;

/// Behaviour knobs for one mock plugin.
#[derive(Clone, Debug)]
pub struct MockSpec {
    pub name: String,
    pub sub_categories: String,
    pub separate_controller: bool,
    pub connection: bool,
    pub audio_inputs: i32,
    pub event_inputs: i32,
    pub has_view: bool,
    pub view_platforms: Vec<&'static str>,
    pub view_size: (i32, i32),
    /// Resize the view requests from inside `attached`.
    pub resize_on_attach: Option<(i32, i32)>,
    /// Request another resize from inside `onSize`.
    pub reentrant_resize: bool,
    pub attach_result: tresult,
    pub output_bus_result: tresult,
    pub input_bus_result: tresult,
    pub set_processing_result: tresult,
    pub process_result: tresult,
    pub controller_state_result: tresult,
}

impl Default for MockSpec {
    fn default() -> Self {
        Self {
            name: "Mock Gain".to_string(),
            sub_categories: "Fx|Dynamics".to_string(),
            separate_controller: true,
            connection: true,
            audio_inputs: 1,
            event_inputs: 1,
            has_view: true,
            view_platforms: vec!["X11EmbedWindowID", "HWND", "NSView"],
            view_size: (400, 300),
            resize_on_attach: None,
            reentrant_resize: false,
            attach_result: kResultOk,
            output_bus_result: kResultOk,
            input_bus_result: kResultOk,
            set_processing_result: kResultOk,
            process_result: kResultOk,
            controller_state_result: kResultOk,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NoteRecord {
    pub on: bool,
    pub channel: i16,
    pub pitch: i16,
    pub velocity: f32,
    pub offset: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessRecord {
    pub frames: i32,
    pub num_inputs: i32,
    pub notes: Vec<NoteRecord>,
    pub params: Vec<(ParamID, ParamValue)>,
    pub sample_rate: f64,
    pub position: i64,
}

/// State shared by every object of one loaded module.
#[derive(Default)]
pub struct Shared {
    pub calls: Vec<String>,
    pub processor_gain: f64,
    pub controller_params: HashMap<ParamID, ParamValue>,
    pub controller_extra: Vec<u8>,
    pub setup: Option<(f64, i32)>,
    pub active: bool,
    pub processing: bool,
    pub processes: Vec<ProcessRecord>,
    pub handler: Option<ComPtr<IComponentHandler>>,
    pub received_messages: Vec<(String, i64)>,
    pub host_name: String,
    pub live_views: i32,
    pub frame_set_before_attach: Option<bool>,
    pub resize_results: Vec<tresult>,
}

// Test-only: mocks are driven from one thread at a time.
unsafe impl Send for Shared {}

pub type SharedState = Arc<Mutex<Shared>>;

fn new_shared() -> SharedState {
    let mut shared = Shared {
        processor_gain: DEFAULT_GAIN,
        ..Shared::default()
    };
    shared.controller_params.insert(GAIN_ID, DEFAULT_GAIN);
    shared.controller_params.insert(MODE_ID, 0.0);
    Arc::new(Mutex::new(shared))
}

fn lock(shared: &SharedState) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap()
}

fn record(shared: &SharedState, call: impl Into<String>) {
    lock(shared).calls.push(call.into());
}

fn copy_cstring(src: &str, dst: &mut [c_char]) {
    dst.fill(0);
    let max = dst.len() - 1;
    for (slot, byte) in dst.iter_mut().zip(src.bytes().take(max)) {
        *slot = byte as c_char;
    }
}

fn copy_string128(src: &str, dst: &mut String128) {
    dst.fill(0);
    for (slot, unit) in dst.iter_mut().zip(src.encode_utf16().take(127)) {
        *slot = unit as TChar;
    }
}

fn into_raw<I: Interface>(ptr: ComPtr<I>) -> *mut I {
    let raw = ptr.as_ptr();
    std::mem::forget(ptr);
    raw
}

unsafe fn read_stream(stream: *mut IBStream) -> Vec<u8> {
    let Some(stream) = (unsafe { ComRef::from_raw(stream) }) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let mut read = 0;
        let result = unsafe { stream.read(chunk.as_mut_ptr() as *mut c_void, 64, &mut read) };
        if result != kResultOk || read <= 0 {
            break;
        }
        out.extend_from_slice(&chunk[..read as usize]);
    }
    out
}

unsafe fn write_stream(stream: *mut IBStream, bytes: &[u8]) -> tresult {
    let Some(stream) = (unsafe { ComRef::from_raw(stream) }) else {
        return kInvalidArgument;
    };
    let mut written = 0;
    unsafe { stream.write(bytes.as_ptr() as *mut c_void, bytes.len() as i32, &mut written) }
}

pub trait Role: 'static {
    const NAME: &'static str;
}

pub struct Split;
pub struct Controller;
pub struct Single;

impl Role for Split {
    const NAME: &'static str = "component";
}
impl Role for Controller {
    const NAME: &'static str = "controller";
}
impl Role for Single {
    const NAME: &'static str = "single";
}

/// One plugin-side object. The role decides which interfaces it exposes.
pub struct MockObject<R: Role> {
    shared: SharedState,
    spec: MockSpec,
    context: RefCell<Option<ComPtr<FUnknown>>>,
    _role: PhantomData<R>,
}

impl<R: Role> MockObject<R> {
    fn new(shared: SharedState, spec: MockSpec) -> Self {
        Self {
            shared,
            spec,
            context: RefCell::new(None),
            _role: PhantomData,
        }
    }

    fn record(&self, what: &str) {
        record(&self.shared, format!("{}.{}", R::NAME, what));
    }

    /// Send a message to the peer through a host-created `IMessage`.
    unsafe fn greet(&self, other: *mut IConnectionPoint) {
        let Some(app) = self
            .context
            .borrow()
            .as_ref()
            .and_then(|c| c.cast::<IHostApplication>())
        else {
            return;
        };
        let mut cid = guid_to_tuid(&IMessage::IID);
        let mut iid = cid;
        let mut obj: *mut c_void = std::ptr::null_mut();
        if unsafe { app.createInstance(&mut cid, &mut iid, &mut obj) } != kResultOk {
            return;
        }
        let Some(message) = (unsafe { ComPtr::from_raw(obj as *mut IMessage) }) else {
            return;
        };
        let id = CString::new(format!("hello from {}", R::NAME)).unwrap();
        let key = CString::new("answer").unwrap();
        unsafe {
            message.setMessageID(id.as_ptr());
            if let Some(attributes) = ComRef::from_raw(message.getAttributes()) {
                attributes.setInt(key.as_ptr(), 42);
            }
            if let Some(other) = ComRef::from_raw(other) {
                other.notify(message.as_ptr());
            }
        }
    }
}

impl Class for MockObject<Split> {
    type Interfaces = (IComponent, IAudioProcessor, IConnectionPoint);
}

impl Class for MockObject<Controller> {
    type Interfaces = (IEditController, IConnectionPoint);
}

impl Class for MockObject<Single> {
    type Interfaces = (IComponent, IAudioProcessor, IEditController);
}

impl<R: Role> IPluginBaseTrait for MockObject<R> {
    unsafe fn initialize(&self, context: *mut FUnknown) -> tresult {
        self.record("initialize");
        let context = unsafe { ComRef::from_raw(context) }.map(|c| c.to_com_ptr());
        if let Some(app) = context.as_ref().and_then(|c| c.cast::<IHostApplication>()) {
            let mut name: String128 = [0; 128];
            if unsafe { app.getName(&mut name) } == kResultOk {
                let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
                lock(&self.shared).host_name = String::from_utf16_lossy(&name[..end]);
            }
        }
        *self.context.borrow_mut() = context;
        kResultOk
    }

    unsafe fn terminate(&self) -> tresult {
        self.record("terminate");
        *self.context.borrow_mut() = None;
        kResultOk
    }
}

impl<R: Role> IComponentTrait for MockObject<R> {
    unsafe fn getControllerClassId(&self, class_id: *mut TUID) -> tresult {
        if !self.spec.separate_controller {
            return kResultFalse;
        }
        unsafe { *class_id = CONTROLLER_CID };
        kResultOk
    }

    unsafe fn setIoMode(&self, _mode: IoMode) -> tresult {
        kResultOk
    }

    unsafe fn getBusCount(&self, media_type: MediaType, dir: BusDirection) -> i32 {
        match (media_type, dir) {
            (m, d) if m == kAudio as i32 && d == kInput as i32 => self.spec.audio_inputs,
            (m, d) if m == kAudio as i32 && d == kOutput as i32 => 1,
            (m, d) if m == kEvent as i32 && d == kInput as i32 => self.spec.event_inputs,
            _ => 0,
        }
    }

    unsafe fn getBusInfo(
        &self,
        media_type: MediaType,
        dir: BusDirection,
        index: i32,
        bus: *mut BusInfo,
    ) -> tresult {
        if bus.is_null() || index != 0 || media_type != kAudio as i32 {
            return kInvalidArgument;
        }
        let bus = unsafe { &mut *bus };
        bus.mediaType = media_type;
        bus.direction = dir;
        bus.channelCount = 2;
        bus.flags = kDefaultActive as u32;
        let name = if dir == kInput as i32 { "Main In" } else { "Main Out" };
        copy_string128(name, &mut bus.name);
        kResultOk
    }

    unsafe fn getRoutingInfo(&self, _in_info: *mut RoutingInfo, _out_info: *mut RoutingInfo) -> tresult {
        kResultFalse
    }

    unsafe fn activateBus(
        &self,
        media_type: MediaType,
        dir: BusDirection,
        _index: i32,
        state: TBool,
    ) -> tresult {
        let kind = if media_type == kAudio as i32 { "audio" } else { "event" };
        let direction = if dir == kInput as i32 { "in" } else { "out" };
        self.record(&format!("activateBus({kind},{direction},{state})"));
        match (media_type, dir) {
            (m, d) if m == kAudio as i32 && d == kOutput as i32 => self.spec.output_bus_result,
            (m, d) if m == kAudio as i32 && d == kInput as i32 => self.spec.input_bus_result,
            _ => kResultOk,
        }
    }

    unsafe fn setActive(&self, state: TBool) -> tresult {
        self.record(&format!("setActive({state})"));
        lock(&self.shared).active = state != 0;
        kResultOk
    }

    unsafe fn setState(&self, state: *mut IBStream) -> tresult {
        let bytes = unsafe { read_stream(state) };
        if bytes.len() != 8 {
            return kResultFalse;
        }
        self.record("setState(component)");
        lock(&self.shared).processor_gain = LittleEndian::read_f64(&bytes);
        kResultOk
    }

    unsafe fn getState(&self, state: *mut IBStream) -> tresult {
        let mut bytes = [0u8; 8];
        LittleEndian::write_f64(&mut bytes, lock(&self.shared).processor_gain);
        unsafe { write_stream(state, &bytes) }
    }
}

impl<R: Role> IAudioProcessorTrait for MockObject<R> {
    unsafe fn setBusArrangements(
        &self,
        _inputs: *mut SpeakerArrangement,
        num_ins: i32,
        _outputs: *mut SpeakerArrangement,
        num_outs: i32,
    ) -> tresult {
        self.record(&format!("setBusArrangements({num_ins},{num_outs})"));
        kResultOk
    }

    unsafe fn getBusArrangement(&self, _dir: BusDirection, _index: i32, arr: *mut SpeakerArrangement) -> tresult {
        if !arr.is_null() {
            unsafe { *arr = vst3::Steinberg::Vst::SpeakerArr::kStereo };
        }
        kResultOk
    }

    unsafe fn canProcessSampleSize(&self, symbolic_sample_size: i32) -> tresult {
        if symbolic_sample_size == 0 { kResultOk } else { kResultFalse }
    }

    unsafe fn getLatencySamples(&self) -> u32 {
        0
    }

    unsafe fn setupProcessing(&self, setup: *mut ProcessSetup) -> tresult {
        let setup = unsafe { &*setup };
        self.record("setupProcessing");
        lock(&self.shared).setup = Some((setup.sampleRate, setup.maxSamplesPerBlock));
        kResultOk
    }

    unsafe fn setProcessing(&self, state: TBool) -> tresult {
        self.record(&format!("setProcessing({state})"));
        if state != 0 && self.spec.set_processing_result != kResultOk {
            return self.spec.set_processing_result;
        }
        lock(&self.shared).processing = state != 0;
        kResultOk
    }

    unsafe fn process(&self, data: *mut ProcessData) -> tresult {
        let data = unsafe { &*data };
        let mut shared = lock(&self.shared);
        let mut record = ProcessRecord {
            frames: data.numSamples,
            num_inputs: data.numInputs,
            ..ProcessRecord::default()
        };

        if let Some(changes) = unsafe { ComRef::from_raw(data.inputParameterChanges) } {
            for index in 0..unsafe { changes.getParameterCount() } {
                let Some(queue) = (unsafe { ComRef::from_raw(changes.getParameterData(index)) })
                else {
                    continue;
                };
                let mut offset = 0;
                let mut value = 0.0;
                let id = unsafe { queue.getParameterId() };
                if unsafe { queue.getPoint(0, &mut offset, &mut value) } == kResultOk {
                    record.params.push((id, value));
                    if id == GAIN_ID {
                        shared.processor_gain = value;
                    }
                }
            }
        }

        if let Some(events) = unsafe { ComRef::from_raw(data.inputEvents) } {
            for index in 0..unsafe { events.getEventCount() } {
                let mut event: Event = unsafe { std::mem::zeroed() };
                if unsafe { events.getEvent(index, &mut event) } != kResultOk {
                    continue;
                }
                let note = match event.r#type as u32 {
                    t if t == kNoteOnEvent as u32 => {
                        let on = unsafe { event.__field0.noteOn };
                        NoteRecord {
                            on: true,
                            channel: on.channel,
                            pitch: on.pitch,
                            velocity: on.velocity,
                            offset: event.sampleOffset,
                        }
                    }
                    t if t == kNoteOffEvent as u32 => {
                        let off = unsafe { event.__field0.noteOff };
                        NoteRecord {
                            on: false,
                            channel: off.channel,
                            pitch: off.pitch,
                            velocity: off.velocity,
                            offset: event.sampleOffset,
                        }
                    }
                    _ => continue,
                };
                record.notes.push(note);
            }
        }

        if let Some(context) = unsafe { data.processContext.as_ref() } {
            record.sample_rate = context.sampleRate;
            record.position = context.projectTimeSamples;
        }

        let frames = data.numSamples.max(0) as usize;
        let gain = shared.processor_gain as f32;
        unsafe {
            let outputs = (*data.outputs).__field0.channelBuffers32;
            for channel in 0..2 {
                let out = *outputs.add(channel);
                for frame in 0..frames {
                    let input = if data.numInputs > 0 {
                        let inputs = (*data.inputs).__field0.channelBuffers32;
                        *(*inputs.add(channel)).add(frame)
                    } else {
                        0.0
                    };
                    *out.add(frame) = input * gain;
                }
            }
        }

        shared.processes.push(record);
        self.spec.process_result
    }

    unsafe fn getTailSamples(&self) -> u32 {
        0
    }
}

impl<R: Role> IConnectionPointTrait for MockObject<R> {
    unsafe fn connect(&self, other: *mut IConnectionPoint) -> tresult {
        if other.is_null() {
            return kInvalidArgument;
        }
        self.record("connect");
        unsafe { self.greet(other) };
        kResultOk
    }

    unsafe fn disconnect(&self, _other: *mut IConnectionPoint) -> tresult {
        self.record("disconnect");
        kResultOk
    }

    unsafe fn notify(&self, message: *mut IMessage) -> tresult {
        let Some(message) = (unsafe { ComRef::from_raw(message) }) else {
            return kInvalidArgument;
        };
        let id = unsafe { CStr::from_ptr(message.getMessageID()) }
            .to_string_lossy()
            .to_string();
        let key = CString::new("answer").unwrap();
        let mut value = 0;
        if let Some(attributes) = unsafe { ComRef::from_raw(message.getAttributes()) } {
            unsafe { attributes.getInt(key.as_ptr(), &mut value) };
        }
        lock(&self.shared).received_messages.push((id, value));
        kResultOk
    }
}

impl<R: Role> IEditControllerTrait for MockObject<R> {
    unsafe fn setComponentState(&self, state: *mut IBStream) -> tresult {
        let bytes = unsafe { read_stream(state) };
        if bytes.len() != 8 {
            return kResultFalse;
        }
        self.record("setComponentState");
        lock(&self.shared)
            .controller_params
            .insert(GAIN_ID, LittleEndian::read_f64(&bytes));
        kResultOk
    }

    unsafe fn setState(&self, state: *mut IBStream) -> tresult {
        let bytes = unsafe { read_stream(state) };
        self.record("setState(controller)");
        if self.spec.controller_state_result != kResultOk {
            return self.spec.controller_state_result;
        }
        lock(&self.shared).controller_extra = bytes;
        kResultOk
    }

    unsafe fn getState(&self, state: *mut IBStream) -> tresult {
        let bytes = lock(&self.shared).controller_extra.clone();
        unsafe { write_stream(state, &bytes) }
    }

    unsafe fn getParameterCount(&self) -> i32 {
        2
    }

    unsafe fn getParameterInfo(&self, param_index: i32, info: *mut ParameterInfo) -> tresult {
        if info.is_null() {
            return kInvalidArgument;
        }
        let info = unsafe { &mut *info };
        match param_index {
            0 => {
                info.id = GAIN_ID;
                copy_string128("Gain", &mut info.title);
                copy_string128("Gain", &mut info.shortTitle);
                copy_string128("dB", &mut info.units);
                info.stepCount = 0;
                info.defaultNormalizedValue = DEFAULT_GAIN;
            }
            1 => {
                info.id = MODE_ID;
                copy_string128("Mode", &mut info.title);
                copy_string128("Mode", &mut info.shortTitle);
                copy_string128("", &mut info.units);
                info.stepCount = 2;
                info.defaultNormalizedValue = 0.0;
            }
            _ => return kInvalidArgument,
        }
        kResultOk
    }

    unsafe fn getParamStringByValue(&self, _id: u32, _value: f64, _string: *mut String128) -> tresult {
        kResultFalse
    }

    unsafe fn getParamValueByString(&self, _id: u32, _string: *mut TChar, _value: *mut f64) -> tresult {
        kResultFalse
    }

    unsafe fn normalizedParamToPlain(&self, _id: u32, value_normalized: f64) -> f64 {
        value_normalized
    }

    unsafe fn plainParamToNormalized(&self, _id: u32, plain_value: f64) -> f64 {
        plain_value
    }

    unsafe fn getParamNormalized(&self, id: u32) -> f64 {
        lock(&self.shared)
            .controller_params
            .get(&id)
            .copied()
            .unwrap_or(0.0)
    }

    unsafe fn setParamNormalized(&self, id: u32, value: f64) -> tresult {
        let mut shared = lock(&self.shared);
        match shared.controller_params.get_mut(&id) {
            Some(slot) => {
                *slot = value;
                kResultOk
            }
            None => kInvalidArgument,
        }
    }

    unsafe fn setComponentHandler(&self, handler: *mut IComponentHandler) -> tresult {
        let handler = unsafe { ComRef::from_raw(handler) }.map(|h| h.to_com_ptr());
        self.record(if handler.is_some() {
            "setComponentHandler(set)"
        } else {
            "setComponentHandler(null)"
        });
        lock(&self.shared).handler = handler;
        kResultOk
    }

    unsafe fn createView(&self, name: *const c_char) -> *mut IPlugView {
        if !self.spec.has_view || name.is_null() {
            return std::ptr::null_mut();
        }
        if unsafe { CStr::from_ptr(name) }.to_bytes() != b"editor" {
            return std::ptr::null_mut();
        }
        let view = ComWrapper::new(MockView::new(self.shared.clone(), self.spec.clone()));
        let Some(ptr) = view.to_com_ptr::<IPlugView>() else {
            return std::ptr::null_mut();
        };
        view.self_ptr.set(ptr.as_ptr());
        into_raw(ptr)
    }
}

/// Editor view. Counts live instances in `Shared::live_views`.
pub struct MockView {
    shared: SharedState,
    spec: MockSpec,
    frame: RefCell<Option<ComPtr<IPlugFrame>>>,
    size: Cell<(i32, i32)>,
    self_ptr: Cell<*mut IPlugView>,
}

impl MockView {
    fn new(shared: SharedState, spec: MockSpec) -> Self {
        lock(&shared).live_views += 1;
        let size = spec.view_size;
        Self {
            shared,
            spec,
            frame: RefCell::new(None),
            size: Cell::new(size),
            self_ptr: Cell::new(std::ptr::null_mut()),
        }
    }

    fn request_resize(&self, width: i32, height: i32) -> Option<tresult> {
        let frame = self.frame.borrow().clone()?;
        let mut rect = ViewRect {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        };
        Some(unsafe { frame.resizeView(self.self_ptr.get(), &mut rect) })
    }
}

impl Drop for MockView {
    fn drop(&mut self) {
        lock(&self.shared).live_views -= 1;
    }
}

impl Class for MockView {
    type Interfaces = (IPlugView,);
}

impl IPlugViewTrait for MockView {
    unsafe fn isPlatformTypeSupported(&self, r#type: FIDString) -> tresult {
        let name = unsafe { CStr::from_ptr(r#type) }.to_string_lossy().to_string();
        if self.spec.view_platforms.contains(&name.as_str()) {
            kResultOk
        } else {
            kResultFalse
        }
    }

    unsafe fn attached(&self, parent: *mut c_void, _type: FIDString) -> tresult {
        record(&self.shared, "view.attached");
        lock(&self.shared).frame_set_before_attach = Some(self.frame.borrow().is_some());
        if parent.is_null() || self.spec.attach_result != kResultOk {
            return self.spec.attach_result;
        }
        if let Some((width, height)) = self.spec.resize_on_attach {
            if let Some(result) = self.request_resize(width, height) {
                lock(&self.shared).resize_results.push(result);
            }
        }
        kResultOk
    }

    unsafe fn removed(&self) -> tresult {
        record(&self.shared, "view.removed");
        kResultOk
    }

    unsafe fn onWheel(&self, _distance: f32) -> tresult {
        kResultFalse
    }

    unsafe fn onKeyDown(&self, _key: char16, _key_code: int16, _modifiers: int16) -> tresult {
        kResultFalse
    }

    unsafe fn onKeyUp(&self, _key: char16, _key_code: int16, _modifiers: int16) -> tresult {
        kResultFalse
    }

    unsafe fn getSize(&self, size: *mut ViewRect) -> tresult {
        if size.is_null() {
            return kInvalidArgument;
        }
        let (width, height) = self.size.get();
        unsafe {
            *size = ViewRect {
                left: 0,
                top: 0,
                right: width,
                bottom: height,
            };
        }
        kResultOk
    }

    unsafe fn onSize(&self, new_size: *mut ViewRect) -> tresult {
        let rect = unsafe { *new_size };
        record(&self.shared, format!("view.onSize({}x{})", rect.right - rect.left, rect.bottom - rect.top));
        self.size.set((rect.right - rect.left, rect.bottom - rect.top));
        if self.spec.reentrant_resize {
            if let Some(result) = self.request_resize(rect.right + 10, rect.bottom + 10) {
                lock(&self.shared).resize_results.push(result);
            }
        }
        kResultOk
    }

    unsafe fn onFocus(&self, _state: TBool) -> tresult {
        kResultOk
    }

    unsafe fn setFrame(&self, frame: *mut IPlugFrame) -> tresult {
        let frame = unsafe { ComRef::from_raw(frame) }.map(|f| f.to_com_ptr());
        record(
            &self.shared,
            if frame.is_some() { "view.setFrame(set)" } else { "view.setFrame(null)" },
        );
        *self.frame.borrow_mut() = frame;
        kResultOk
    }

    unsafe fn canResize(&self) -> tresult {
        kResultOk
    }

    unsafe fn checkSizeConstraint(&self, _rect: *mut ViewRect) -> tresult {
        kResultOk
    }
}

pub struct MockFactory {
    shared: SharedState,
    spec: MockSpec,
}

impl Class for MockFactory {
    type Interfaces = (IPluginFactory2,);
}

impl MockFactory {
    fn class_count(&self) -> i32 {
        if self.spec.separate_controller { 2 } else { 1 }
    }
}

impl IPluginFactoryTrait for MockFactory {
    unsafe fn getFactoryInfo(&self, info: *mut PFactoryInfo) -> tresult {
        if info.is_null() {
            return kInvalidArgument;
        }
        let info = unsafe { &mut *info };
        copy_cstring("Mock Audio", &mut info.vendor);
        copy_cstring("https://example.invalid", &mut info.url);
        copy_cstring("mock@example.invalid", &mut info.email);
        kResultOk
    }

    unsafe fn countClasses(&self) -> i32 {
        self.class_count()
    }

    unsafe fn getClassInfo(&self, index: i32, info: *mut PClassInfo) -> tresult {
        if info.is_null() || index >= self.class_count() {
            return kInvalidArgument;
        }
        let info = unsafe { &mut *info };
        if index == 0 {
            info.cid = COMPONENT_CID;
            copy_cstring("Audio Module Class", &mut info.category);
            copy_cstring(&self.spec.name, &mut info.name);
        } else {
            info.cid = CONTROLLER_CID;
            copy_cstring("Component Controller Class", &mut info.category);
            copy_cstring(&format!("{} Controller", self.spec.name), &mut info.name);
        }
        kResultOk
    }

    unsafe fn createInstance(&self, cid: FIDString, iid: FIDString, obj: *mut *mut c_void) -> tresult {
        if cid.is_null() || iid.is_null() || obj.is_null() {
            return kInvalidArgument;
        }
        let requested = unsafe { *(cid as *const TUID) };
        let unknown = if requested == COMPONENT_CID && self.spec.separate_controller {
            record(&self.shared, "factory.create(component)");
            ComWrapper::new(MockObject::<Split>::new(self.shared.clone(), self.spec.clone()))
                .to_com_ptr::<FUnknown>()
        } else if requested == COMPONENT_CID {
            record(&self.shared, "factory.create(single)");
            ComWrapper::new(MockObject::<Single>::new(self.shared.clone(), self.spec.clone()))
                .to_com_ptr::<FUnknown>()
        } else if requested == CONTROLLER_CID && self.spec.separate_controller {
            record(&self.shared, "factory.create(controller)");
            ComWrapper::new(MockObject::<Controller>::new(self.shared.clone(), self.spec.clone()))
                .to_com_ptr::<FUnknown>()
        } else {
            None
        };
        let Some(unknown) = unknown else {
            unsafe { *obj = std::ptr::null_mut() };
            return kInvalidArgument;
        };
        let ptr = unknown.as_ptr();
        unsafe { ((*(*ptr).vtbl).queryInterface)(ptr, iid as *const TUID, obj) }
    }
}

impl IPluginFactory2Trait for MockFactory {
    unsafe fn getClassInfo2(&self, index: i32, info: *mut PClassInfo2) -> tresult {
        if info.is_null() || index >= self.class_count() {
            return kInvalidArgument;
        }
        let info = unsafe { &mut *info };
        if index == 0 {
            info.cid = COMPONENT_CID;
            copy_cstring("Audio Module Class", &mut info.category);
            copy_cstring(&self.spec.name, &mut info.name);
            copy_cstring(&self.spec.sub_categories, &mut info.subCategories);
        } else {
            info.cid = CONTROLLER_CID;
            copy_cstring("Component Controller Class", &mut info.category);
            copy_cstring(&format!("{} Controller", self.spec.name), &mut info.name);
        }
        copy_cstring("1.0.0", &mut info.version);
        kResultOk
    }
}

/// Serves mock modules. Bundles whose name contains "Corrupt" fail to
/// open; every other bundle becomes a mock plugin named after its stem
/// unless `fixed_name` is set.
pub struct MockLoader {
    spec: MockSpec,
    fixed_name: bool,
    opened: Arc<Mutex<Vec<SharedState>>>,
}

impl ModuleLoader for MockLoader {
    fn open(&self, bundle: &Path) -> Result<PluginModule, String> {
        let stem = bundle
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if stem.contains("Corrupt") {
            return Err(format!("Failed to load VST3 module {:?}: invalid ELF header", bundle));
        }
        let mut spec = self.spec.clone();
        if !self.fixed_name {
            spec.name = stem;
        }
        let shared = new_shared();
        self.opened.lock().unwrap().push(shared.clone());
        let factory = ComWrapper::new(MockFactory { shared, spec })
            .to_com_ptr::<IPluginFactory>()
            .ok_or("factory cast failed")?;
        Ok(PluginModule::from_factory(bundle, factory))
    }
}

/// A host wired to a `MockLoader`.
pub struct Harness {
    pub host: Vst3Host,
    opened: Arc<Mutex<Vec<SharedState>>>,
}

pub const MOCK_BUNDLE: &str = "/mock/Mock Gain.vst3";

impl Harness {
    pub fn new(spec: MockSpec) -> Self {
        Self::with_config(spec, HostConfig::default())
    }

    pub fn with_config(spec: MockSpec, config: HostConfig) -> Self {
        Self::build(spec, config, true)
    }

    /// Plugin names follow bundle stems, for scanning.
    pub fn scanning(spec: MockSpec) -> Self {
        Self::build(spec, HostConfig::default(), false)
    }

    fn build(spec: MockSpec, config: HostConfig, fixed_name: bool) -> Self {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let loader = MockLoader {
            spec,
            fixed_name,
            opened: opened.clone(),
        };
        Self {
            host: Vst3Host::with_loader(config, Box::new(loader)),
            opened,
        }
    }

    pub fn load(&self) -> plughost_engine::PluginInstance {
        self.host.load(Path::new(MOCK_BUNDLE)).unwrap()
    }

    /// Shared record of the most recently opened module.
    pub fn shared(&self) -> SharedState {
        self.opened.lock().unwrap().last().cloned().unwrap()
    }

    pub fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

pub fn calls(shared: &SharedState) -> Vec<String> {
    lock(shared).calls.clone()
}

pub fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} not found in {calls:?}"))
}

/// Ask the plugin's controller to request a restart through the host.
pub fn request_restart(shared: &SharedState, flags: i32) -> tresult {
    let handler = lock(shared).handler.clone().expect("no component handler");
    unsafe { handler.restartComponent(flags) }
}
