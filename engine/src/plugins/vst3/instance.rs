use super::editor::{EditorHost, EditorState};
use super::host::{HostContext, PluginDescriptor, Vst3Host};
use super::midi::{MidiEventKind, MidiRequest};
use super::module::PluginModule;
use super::port::{BusInfo, ParameterInfo};
use super::processor::{AudioBridge, ProcessError};
use super::state::{MemoryStream, StateBlob};
use super::window::{NativeWindow, ResizeHandler};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vst3::Steinberg::Vst::BusDirections_::{kInput, kOutput};
use vst3::Steinberg::Vst::MediaTypes_::{kAudio, kEvent};
use vst3::Steinberg::Vst::ProcessModes_::kRealtime;
use vst3::Steinberg::Vst::RestartFlags_::{kIoChanged, kReloadComponent};
use vst3::Steinberg::Vst::SymbolicSampleSizes_::kSample32;
use vst3::Steinberg::Vst::{
    IAudioProcessor, IAudioProcessorTrait, IComponent, IComponentTrait, IConnectionPoint,
    IConnectionPointTrait, IEditController, IEditControllerTrait, ProcessSetup, SpeakerArr,
    SpeakerArrangement,
};
use vst3::Steinberg::{
    FUnknown, IBStream, IPluginBaseTrait, TUID, kNotImplemented, kResultOk,
};
use vst3::{ComPtr, ComWrapper};

/// A loaded plugin: module, component, optional processor and controller,
/// and all per-instance runtime state.
///
/// Fields drop in declaration order; the module is last so it stays mapped
/// until every interface obtained from it is released.
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    torn_down: bool,
    sample_rate: f64,
    max_block_size: usize,
    initialized: bool,
    active: bool,
    editor: EditorHost,
    bridge: AudioBridge,
    connection: Option<(ComPtr<IConnectionPoint>, ComPtr<IConnectionPoint>)>,
    processor: Option<ComPtr<IAudioProcessor>>,
    controller: Option<ComPtr<IEditController>>,
    separate_controller: bool,
    component: ComPtr<IComponent>,
    host: Arc<HostContext>,
    module: PluginModule,
}

// Only the COM pointers (and the editor frame wrapping them) are not Send.
// They are touched solely by the thread that currently owns the instance;
// the resize handler is required to be Send itself.
unsafe impl Send for PluginInstance {}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.descriptor.name)
            .field("path", &self.module.path())
            .field("initialized", &self.initialized)
            .field("active", &self.active)
            .field("has_controller", &self.controller.is_some())
            .finish()
    }
}

impl PluginInstance {
    pub(crate) fn load(host: &Vst3Host, path: &Path) -> Result<Self, String> {
        let context = host.context().clone();
        let fail = |message: String| {
            error!("{}", message);
            context.record_error(message)
        };

        let module = host.loader().open(path).map_err(fail)?;
        let classes = module.classes();
        let class = classes
            .iter()
            .find(|c| c.is_audio_module())
            .ok_or_else(|| fail(format!("No audio module class found in {}", path.display())))?;

        let component = module.create_component(&class.cid).map_err(fail)?;
        let application = context
            .application()
            .ok_or_else(|| fail("Host application context unavailable".to_string()))?;

        let result = unsafe { component.initialize(application.as_ptr()) };
        if result != kResultOk {
            return Err(fail(format!(
                "Failed to initialize component (result: {})",
                result
            )));
        }

        let processor = component.cast::<IAudioProcessor>();
        if processor.is_none() {
            warn!("{} has no IAudioProcessor interface", class.name);
        }

        let (controller, separate_controller) = match component.cast::<IEditController>() {
            Some(controller) => (Some(controller), false),
            None => (create_controller(&module, &component, &application), true),
        };

        if let Some(controller) = &controller {
            match context.component_handler() {
                Some(handler) => {
                    let result = unsafe { controller.setComponentHandler(handler.as_ptr()) };
                    debug!("setComponentHandler result: {}", result);
                }
                None => warn!("Component handler unavailable"),
            }
        }

        let connection = match (&controller, separate_controller) {
            (Some(controller), true) => connect(&component, controller),
            _ => None,
        };

        let vendor = module.factory_info().map(|i| i.vendor).unwrap_or_default();
        let descriptor = PluginDescriptor::from_class(path, &vendor, class);
        info!(
            "Loaded VST3 plugin '{}' (controller: {}, connected: {})",
            descriptor.name,
            controller.is_some(),
            connection.is_some()
        );

        let config = host.config();
        Ok(Self {
            descriptor,
            torn_down: false,
            sample_rate: config.sample_rate,
            max_block_size: config.max_block_size,
            initialized: false,
            active: false,
            editor: EditorHost::new(),
            bridge: AudioBridge::new(config.midi_queue_capacity, config.parameter_queue_capacity),
            connection,
            processor,
            controller,
            separate_controller,
            component,
            host: context,
            module,
        })
    }

    fn fail(&self, message: impl Into<String>) -> String {
        let message = message.into();
        error!("{}", message);
        self.host.record_error(message)
    }

    pub fn plugin_info(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &Path {
        self.module.path()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_processor(&self) -> bool {
        self.processor.is_some()
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Frames processed since the last Initialize.
    pub fn sample_position(&self) -> i64 {
        self.bridge.sample_position()
    }

    pub fn audio_bus_counts(&self) -> (usize, usize) {
        (
            self.bus_count(kAudio as i32, kInput as i32),
            self.bus_count(kAudio as i32, kOutput as i32),
        )
    }

    pub fn event_bus_counts(&self) -> (usize, usize) {
        (
            self.bus_count(kEvent as i32, kInput as i32),
            self.bus_count(kEvent as i32, kOutput as i32),
        )
    }

    fn bus_count(&self, media: i32, direction: i32) -> usize {
        unsafe { self.component.getBusCount(media, direction) }.max(0) as usize
    }

    /// Audio buses as `(inputs, outputs)`.
    pub fn audio_buses(&self) -> (Vec<BusInfo>, Vec<BusInfo>) {
        (
            self.buses(kAudio as i32, kInput as i32),
            self.buses(kAudio as i32, kOutput as i32),
        )
    }

    fn buses(&self, media: i32, direction: i32) -> Vec<BusInfo> {
        (0..self.bus_count(media, direction))
            .filter_map(|index| {
                let mut info: vst3::Steinberg::Vst::BusInfo = unsafe { std::mem::zeroed() };
                let result =
                    unsafe { self.component.getBusInfo(media, direction, index as i32, &mut info) };
                (result == kResultOk).then(|| BusInfo::from_vst3(index, &info))
            })
            .collect()
    }

    /// Negotiate the processing format and enable the main buses.
    pub fn initialize(&mut self, sample_rate: f64, max_block_size: usize) -> Result<(), String> {
        if self.active {
            return Err(self.fail("Cannot initialize an active plugin; deactivate first"));
        }
        if sample_rate <= 0.0 || max_block_size == 0 {
            return Err(self.fail(format!(
                "Invalid processing setup: {} Hz, {} frames",
                sample_rate, max_block_size
            )));
        }
        let Some(processor) = self.processor.clone() else {
            return Err(self.fail("Plugin has no audio processor"));
        };

        let result = unsafe { processor.canProcessSampleSize(kSample32 as i32) };
        if result != kResultOk {
            return Err(self.fail(format!(
                "Plugin does not support 32-bit sample size (result: {})",
                result
            )));
        }

        let (input_count, output_count) = self.audio_bus_counts();
        let mut inputs: [SpeakerArrangement; 1] = [SpeakerArr::kStereo];
        let mut outputs: [SpeakerArrangement; 1] = [SpeakerArr::kStereo];
        let result = unsafe {
            processor.setBusArrangements(
                inputs.as_mut_ptr(),
                input_count.min(1) as i32,
                outputs.as_mut_ptr(),
                output_count.min(1) as i32,
            )
        };
        if result != kResultOk {
            warn!("Stereo bus arrangement refused (result: {})", result);
        }

        let mut setup = ProcessSetup {
            processMode: kRealtime as i32,
            symbolicSampleSize: kSample32 as i32,
            maxSamplesPerBlock: max_block_size as i32,
            sampleRate: sample_rate,
        };
        let result = unsafe { processor.setupProcessing(&mut setup) };
        if result != kResultOk {
            return Err(self.fail(format!("Failed to setup processing (result: {})", result)));
        }

        let result = unsafe { self.component.activateBus(kAudio as i32, kOutput as i32, 0, 1) };
        if result != kResultOk {
            return Err(self.fail(format!(
                "Failed to activate audio output bus (result: {})",
                result
            )));
        }

        let mut has_input = false;
        if input_count > 0 {
            let result = unsafe { self.component.activateBus(kAudio as i32, kInput as i32, 0, 1) };
            if result == kResultOk {
                has_input = true;
            } else {
                warn!("Audio input bus not activated (result: {})", result);
            }
        }

        if self.bus_count(kEvent as i32, kInput as i32) > 0 {
            let result = unsafe { self.component.activateBus(kEvent as i32, kInput as i32, 0, 1) };
            if result != kResultOk {
                warn!("Event input bus not activated (result: {})", result);
            }
        }

        self.sample_rate = sample_rate;
        self.max_block_size = max_block_size;
        self.bridge.configure(sample_rate, max_block_size, has_input);
        self.initialized = true;
        debug!(
            "Initialized '{}' at {} Hz, {} frames",
            self.descriptor.name, sample_rate, max_block_size
        );
        Ok(())
    }

    pub fn activate(&mut self) -> Result<(), String> {
        if self.active {
            return Ok(());
        }
        if !self.initialized {
            return Err(self.fail("Plugin must be initialized before activation"));
        }

        let result = unsafe { self.component.setActive(1) };
        if result != kResultOk {
            return Err(self.fail(format!("Failed to activate component (result: {})", result)));
        }

        if let Some(processor) = &self.processor {
            let result = unsafe { processor.setProcessing(1) };
            if result != kResultOk && result != kNotImplemented {
                unsafe { self.component.setActive(0) };
                return Err(self.fail(format!(
                    "Failed to enable processing state (result: {})",
                    result
                )));
            }
        }

        self.active = true;
        debug!("Activated '{}'", self.descriptor.name);
        Ok(())
    }

    /// Stop processing. Calling it on an inactive instance does nothing.
    pub fn deactivate(&mut self) -> Result<(), String> {
        if !self.active {
            return Ok(());
        }
        if let Some(processor) = &self.processor {
            let result = unsafe { processor.setProcessing(0) };
            if result != kResultOk && result != kNotImplemented {
                warn!("setProcessing(false) failed (result: {})", result);
            }
        }
        let result = unsafe { self.component.setActive(0) };
        if result != kResultOk {
            warn!("setActive(false) failed (result: {})", result);
        }
        self.active = false;
        self.bridge.clear();
        debug!("Deactivated '{}'", self.descriptor.name);
        Ok(())
    }

    /// React to restart flags collected from the component handler.
    /// Reload and I/O changes re-run Initialize, restoring the active state.
    pub fn handle_restart(&mut self, flags: i32) -> Result<(), String> {
        let reconfigure = flags & (kReloadComponent as i32 | kIoChanged as i32) != 0;
        if !reconfigure {
            if flags != 0 {
                debug!("Restart flags {:#x} need no reconfiguration", flags);
            }
            return Ok(());
        }
        if !self.initialized {
            return Ok(());
        }
        info!("Reconfiguring '{}' (restart flags {:#x})", self.descriptor.name, flags);
        let was_active = self.active;
        self.deactivate()?;
        self.initialize(self.sample_rate, self.max_block_size)?;
        if was_active {
            self.activate()?;
        }
        Ok(())
    }

    /// Run one block of stereo audio. Queued MIDI and parameter changes are
    /// consumed by this call whatever its outcome.
    pub fn process(
        &mut self,
        in_l: &[f32],
        in_r: &[f32],
        out_l: &mut [f32],
        out_r: &mut [f32],
        num_frames: usize,
    ) -> Result<(), ProcessError> {
        let result = match (&self.processor, self.active) {
            (_, false) => Err(ProcessError::NotActive),
            (None, true) => Err(ProcessError::NoProcessor),
            (Some(processor), true) => {
                self.bridge
                    .process(processor, [in_l, in_r], [out_l, out_r], num_frames)
            }
        };
        if let Err(e) = &result {
            self.bridge.clear();
            self.host.try_record_error(e);
        }
        result
    }

    pub fn queue_midi_event(
        &mut self,
        kind: i32,
        channel: i32,
        data1: i32,
        data2: i32,
        sample_offset: i32,
    ) -> Result<(), String> {
        let request = MidiEventKind::try_from(kind).and_then(|kind| {
            let byte = |value: i32| {
                u8::try_from(value).map_err(|_| format!("MIDI value {value} out of range"))
            };
            MidiRequest::new(kind, byte(channel)?, byte(data1)?, byte(data2)?)
        });
        match request {
            Ok(request) => self.queue_midi_request(request, sample_offset),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Queue a raw MIDI 1.0 channel message.
    pub fn queue_midi_bytes(&mut self, bytes: &[u8], sample_offset: i32) -> Result<(), String> {
        match MidiRequest::parse(bytes) {
            Ok(Some(request)) => self.queue_midi_request(request, sample_offset),
            Ok(None) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn queue_midi_request(&mut self, request: MidiRequest, sample_offset: i32) -> Result<(), String> {
        if sample_offset < 0 || sample_offset as usize >= self.max_block_size {
            return Err(self.fail(format!(
                "MIDI sample offset {} outside block of {} frames",
                sample_offset, self.max_block_size
            )));
        }
        let Some(event) = request.to_event(sample_offset) else {
            debug!("Control change {} ignored", request.data1);
            return Ok(());
        };
        self.bridge.queue_event(event).map_err(|e| self.fail(e))
    }

    pub fn pending_midi_events(&self) -> usize {
        self.bridge.pending_events()
    }

    /// Value queued for `id` that the next block will deliver.
    pub fn pending_parameter_change(&self, id: u32) -> Option<f64> {
        self.bridge.pending_parameter(id)
    }

    fn require_controller(&self) -> Result<&ComPtr<IEditController>, String> {
        self.controller
            .as_ref()
            .ok_or_else(|| self.fail("Plugin has no edit controller"))
    }

    pub fn parameter_count(&self) -> usize {
        self.controller
            .as_ref()
            .map(|c| unsafe { c.getParameterCount() }.max(0) as usize)
            .unwrap_or(0)
    }

    pub fn parameter_info(&self, index: usize) -> Option<ParameterInfo> {
        let controller = self.controller.as_ref()?;
        let mut info: vst3::Steinberg::Vst::ParameterInfo = unsafe { std::mem::zeroed() };
        let result = unsafe { controller.getParameterInfo(index as i32, &mut info) };
        (result == kResultOk).then(|| ParameterInfo::from_vst3(&info))
    }

    /// All parameters, queried fresh from the controller.
    pub fn parameters(&self) -> Vec<ParameterInfo> {
        (0..self.parameter_count())
            .filter_map(|index| self.parameter_info(index))
            .collect()
    }

    pub fn get_parameter(&self, id: u32) -> Result<f64, String> {
        let controller = self.require_controller()?;
        Ok(unsafe { controller.getParamNormalized(id) })
    }

    /// Set a normalized value on the controller and queue it for the
    /// processor's next block.
    pub fn set_parameter(&mut self, id: u32, value: f64) -> Result<(), String> {
        let value = value.clamp(0.0, 1.0);
        let controller = self.require_controller()?;
        let result = unsafe { controller.setParamNormalized(id, value) };
        if result != kResultOk {
            return Err(self.fail(format!(
                "Failed to set parameter {} (result: {})",
                id, result
            )));
        }
        self.bridge.queue_parameter(id, value).map_err(|e| self.fail(e))
    }

    fn component_state(&self) -> Result<Vec<u8>, String> {
        let stream = MemoryStream::new().into_com();
        let result = unsafe { self.component.getState(stream_ptr(&stream)) };
        if result != kResultOk {
            return Err(self.fail(format!("Failed to get component state (result: {})", result)));
        }
        Ok(stream.take_bytes())
    }

    fn controller_state(&self) -> Vec<u8> {
        let Some(controller) = &self.controller else {
            return Vec::new();
        };
        let stream = MemoryStream::new().into_com();
        let result = unsafe { controller.getState(stream_ptr(&stream)) };
        if result != kResultOk {
            warn!("Failed to get controller state (result: {})", result);
            return Vec::new();
        }
        stream.take_bytes()
    }

    /// Capture the framed processor and controller state.
    pub fn save_state(&self) -> Result<Vec<u8>, String> {
        let processor = self.component_state()?;
        let controller = self.controller_state();
        StateBlob::new(&processor, &controller)
            .encode()
            .map_err(|e| self.fail(e))
    }

    pub fn state_size(&self) -> Result<usize, String> {
        let processor = self.component_state()?;
        let controller = self.controller_state();
        Ok(StateBlob::new(&processor, &controller).encoded_len())
    }

    /// Write the state blob into `out`, returning the bytes written.
    pub fn get_state(&self, out: &mut [u8]) -> Result<usize, String> {
        let processor = self.component_state()?;
        let controller = self.controller_state();
        StateBlob::new(&processor, &controller)
            .write_to(out)
            .map_err(|e| self.fail(e))
    }

    /// Restore a blob from `save_state`. The blob is validated in full
    /// before any of it reaches the plugin.
    pub fn set_state(&mut self, data: &[u8]) -> Result<(), String> {
        let blob = StateBlob::decode(data).map_err(|e| self.fail(e))?;

        if !blob.processor.is_empty() {
            let stream = MemoryStream::from_bytes(blob.processor).into_com();
            let result = unsafe { self.component.setState(stream_ptr(&stream)) };
            if result != kResultOk {
                return Err(self.fail(format!(
                    "Failed to set component state (result: {})",
                    result
                )));
            }
        }

        let Some(controller) = &self.controller else {
            return Ok(());
        };

        // Mirror the processor state so the controller shows matching values.
        if !blob.processor.is_empty() {
            let stream = MemoryStream::from_bytes(blob.processor).into_com();
            let result = unsafe { controller.setComponentState(stream_ptr(&stream)) };
            if result != kResultOk {
                debug!("setComponentState result: {}", result);
            }
        }

        if !blob.controller.is_empty() {
            let stream = MemoryStream::from_bytes(blob.controller).into_com();
            let result = unsafe { controller.setState(stream_ptr(&stream)) };
            if result != kResultOk {
                warn!("Failed to set controller state (result: {})", result);
            }
        }
        Ok(())
    }

    pub fn editor_state(&self) -> EditorState {
        self.editor.state()
    }

    pub fn has_editor(&self) -> bool {
        self.editor.has_editor(self.controller.as_ref())
    }

    pub fn open_editor(&mut self) -> Result<(), String> {
        let result = self.editor.open(self.controller.as_ref());
        result.map_err(|e| self.fail(e))
    }

    pub fn attach_editor(&mut self, window: NativeWindow) -> Result<(), String> {
        let result = self.editor.attach(window);
        result.map_err(|e| self.fail(e))
    }

    pub fn detach_editor(&mut self) -> Result<(), String> {
        let result = self.editor.detach();
        result.map_err(|e| self.fail(e))
    }

    pub fn close_editor(&mut self) -> Result<(), String> {
        let result = self.editor.close();
        result.map_err(|e| self.fail(e))
    }

    pub fn editor_size(&self) -> Option<(i32, i32)> {
        self.editor.size()
    }

    pub fn editor_idle(&self) {
        self.editor.idle();
    }

    pub fn set_editor_resize_handler(&mut self, handler: ResizeHandler) {
        self.editor.set_resize_handler(handler);
    }

    /// Tear the plugin down and release the module.
    pub fn unload(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Err(e) = self.deactivate() {
            warn!("Deactivate during unload failed: {}", e);
        }
        self.editor.force_close();

        if let Some((component_point, controller_point)) = self.connection.take() {
            unsafe {
                component_point.disconnect(controller_point.as_ptr());
                controller_point.disconnect(component_point.as_ptr());
            }
        }

        if let Some(controller) = self.controller.take() {
            unsafe { controller.setComponentHandler(std::ptr::null_mut()) };
            if self.separate_controller {
                let result = unsafe { controller.terminate() };
                if result != kResultOk {
                    warn!("Controller terminate failed (result: {})", result);
                }
            }
        }
        self.processor = None;

        let result = unsafe { self.component.terminate() };
        if result != kResultOk {
            warn!("Component terminate failed (result: {})", result);
        }
        info!("Unloaded VST3 plugin '{}'", self.descriptor.name);
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn stream_ptr(stream: &ComWrapper<MemoryStream>) -> *mut IBStream {
    stream
        .as_com_ref::<IBStream>()
        .map(|r| r.as_ptr())
        .unwrap_or(std::ptr::null_mut())
}

/// Instantiate the separate controller class named by the component.
/// Every failure here leaves the plugin usable without a controller.
fn create_controller(
    module: &PluginModule,
    component: &ComPtr<IComponent>,
    application: &ComPtr<FUnknown>,
) -> Option<ComPtr<IEditController>> {
    let mut cid: TUID = [0; 16];
    let result = unsafe { component.getControllerClassId(&mut cid) };
    if result != kResultOk || cid.iter().all(|b| *b == 0) {
        debug!("Component names no controller class (result: {})", result);
        return None;
    }

    let controller = match module.create_controller(&cid) {
        Ok(controller) => controller,
        Err(e) => {
            warn!("Failed to create edit controller: {}", e);
            return None;
        }
    };
    let result = unsafe { controller.initialize(application.as_ptr()) };
    if result != kResultOk {
        warn!("Failed to initialize edit controller (result: {})", result);
        return None;
    }
    Some(controller)
}

fn connect(
    component: &ComPtr<IComponent>,
    controller: &ComPtr<IEditController>,
) -> Option<(ComPtr<IConnectionPoint>, ComPtr<IConnectionPoint>)> {
    let (Some(component_point), Some(controller_point)) = (
        component.cast::<IConnectionPoint>(),
        controller.cast::<IConnectionPoint>(),
    ) else {
        debug!("Plugin does not support IConnectionPoint");
        return None;
    };
    unsafe {
        component_point.connect(controller_point.as_ptr());
        controller_point.connect(component_point.as_ptr());
    }
    Some((component_point, controller_point))
}
