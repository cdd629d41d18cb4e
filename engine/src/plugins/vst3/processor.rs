use super::midi::EventList;
use std::cell::Cell;
use std::fmt;
use vst3::Steinberg::Vst::ProcessModes_::kRealtime;
use vst3::Steinberg::Vst::SymbolicSampleSizes_::kSample32;
use vst3::Steinberg::Vst::{
    AudioBusBuffers, AudioBusBuffers__type0, Event, IAudioProcessor, IAudioProcessorTrait,
    IEventList, IParamValueQueue, IParamValueQueueTrait, IParameterChanges,
    IParameterChangesTrait, ParamID, ParamValue, ProcessContext, ProcessData,
};
use vst3::Steinberg::{int32, kInvalidArgument, kResultFalse, kResultOk, tresult};
use vst3::{Class, ComPtr, ComWrapper};

/// Failure of a real-time `process` call. `Copy` so the audio thread never
/// allocates to report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessError {
    NotActive,
    NoProcessor,
    BlockTooLarge { frames: usize, max: usize },
    BufferTooShort { frames: usize },
    /// Non-success result from the plugin. Output buffers are still valid.
    Plugin(i32),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotActive => write!(f, "Plugin is not active"),
            Self::NoProcessor => write!(f, "Plugin has no audio processor"),
            Self::BlockTooLarge { frames, max } => {
                write!(f, "Block of {frames} frames exceeds max block size {max}")
            }
            Self::BufferTooShort { frames } => {
                write!(f, "Audio buffer shorter than {frames} frames")
            }
            Self::Plugin(result) => write!(f, "VST3 process failed (result: {result})"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Single-point value queue for one parameter in one block.
pub struct ParamValueQueue {
    param_id: Cell<ParamID>,
    value: Cell<ParamValue>,
    sample_offset: Cell<i32>,
}

impl ParamValueQueue {
    fn new() -> Self {
        Self {
            param_id: Cell::new(0),
            value: Cell::new(0.0),
            sample_offset: Cell::new(0),
        }
    }

    fn reset(&self, id: ParamID, value: ParamValue) {
        self.param_id.set(id);
        self.value.set(value);
        self.sample_offset.set(0);
    }
}

impl Class for ParamValueQueue {
    type Interfaces = (IParamValueQueue,);
}

impl IParamValueQueueTrait for ParamValueQueue {
    unsafe fn getParameterId(&self) -> ParamID {
        self.param_id.get()
    }

    unsafe fn getPointCount(&self) -> int32 {
        1
    }

    unsafe fn getPoint(
        &self,
        index: int32,
        sample_offset: *mut int32,
        value: *mut ParamValue,
    ) -> tresult {
        if index != 0 {
            return kResultFalse;
        }
        if sample_offset.is_null() || value.is_null() {
            return kInvalidArgument;
        }
        unsafe {
            *sample_offset = self.sample_offset.get();
            *value = self.value.get();
        }
        kResultOk
    }

    // Only the latest point is kept.
    unsafe fn addPoint(&self, sample_offset: int32, value: ParamValue, index: *mut int32) -> tresult {
        self.sample_offset.set(sample_offset);
        self.value.set(value);
        if !index.is_null() {
            unsafe { *index = 0 };
        }
        kResultOk
    }
}

/// Preallocated set of parameter changes delivered with the next block.
pub struct ParameterChanges {
    count: Cell<usize>,
    queues: Vec<ComWrapper<ParamValueQueue>>,
}

impl ParameterChanges {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            count: Cell::new(0),
            queues: (0..capacity)
                .map(|_| ComWrapper::new(ParamValueQueue::new()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.count.set(0);
    }

    /// Queue `value` for `id`, replacing an earlier change to the same id.
    pub fn set(&self, id: ParamID, value: ParamValue) -> Result<(), String> {
        let index = self
            .slot_for(id)
            .ok_or_else(|| format!("Parameter queue full ({} changes)", self.queues.len()))?;
        self.queues[index].reset(id, value);
        Ok(())
    }

    /// Value queued for `id` in the pending block.
    pub fn pending(&self, id: ParamID) -> Option<ParamValue> {
        self.queues[..self.len()]
            .iter()
            .find(|q| q.param_id.get() == id)
            .map(|q| q.value.get())
    }

    fn slot_for(&self, id: ParamID) -> Option<usize> {
        let count = self.len();
        if let Some(index) = self.queues[..count]
            .iter()
            .position(|q| q.param_id.get() == id)
        {
            return Some(index);
        }
        if count < self.queues.len() {
            self.count.set(count + 1);
            Some(count)
        } else {
            None
        }
    }

    fn queue_ptr(&self, index: usize) -> *mut IParamValueQueue {
        self.queues
            .get(index)
            .and_then(|q| q.as_com_ref::<IParamValueQueue>())
            .map(|r| r.as_ptr())
            .unwrap_or(std::ptr::null_mut())
    }
}

impl Class for ParameterChanges {
    type Interfaces = (IParameterChanges,);
}

impl IParameterChangesTrait for ParameterChanges {
    unsafe fn getParameterCount(&self) -> int32 {
        self.len() as int32
    }

    unsafe fn getParameterData(&self, index: int32) -> *mut IParamValueQueue {
        if index < 0 || index as usize >= self.len() {
            return std::ptr::null_mut();
        }
        self.queue_ptr(index as usize)
    }

    unsafe fn addParameterData(&self, id: *const ParamID, index: *mut int32) -> *mut IParamValueQueue {
        if id.is_null() {
            return std::ptr::null_mut();
        }
        let id = unsafe { *id };
        let existing = self.pending(id);
        let Some(slot) = self.slot_for(id) else {
            return std::ptr::null_mut();
        };
        if existing.is_none() {
            self.queues[slot].reset(id, 0.0);
        }
        if !index.is_null() {
            unsafe { *index = slot as int32 };
        }
        self.queue_ptr(slot)
    }
}

/// Per-instance state of the real-time bridge: negotiated format, the
/// pending event and parameter lists, and the transport position.
pub struct AudioBridge {
    events: ComWrapper<EventList>,
    parameters: ComWrapper<ParameterChanges>,
    sample_rate: f64,
    max_block_size: usize,
    has_input_bus: bool,
    sample_position: i64,
}

impl AudioBridge {
    pub fn new(midi_capacity: usize, parameter_capacity: usize) -> Self {
        Self {
            events: ComWrapper::new(EventList::with_capacity(midi_capacity)),
            parameters: ComWrapper::new(ParameterChanges::with_capacity(parameter_capacity)),
            sample_rate: 0.0,
            max_block_size: 0,
            has_input_bus: false,
            sample_position: 0,
        }
    }

    pub fn configure(&mut self, sample_rate: f64, max_block_size: usize, has_input_bus: bool) {
        self.sample_rate = sample_rate;
        self.max_block_size = max_block_size;
        self.has_input_bus = has_input_bus;
        self.sample_position = 0;
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn sample_position(&self) -> i64 {
        self.sample_position
    }

    pub fn queue_event(&self, event: Event) -> Result<(), String> {
        self.events.push(event)
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn queue_parameter(&self, id: ParamID, value: ParamValue) -> Result<(), String> {
        self.parameters.set(id, value)
    }

    pub fn pending_parameter(&self, id: ParamID) -> Option<ParamValue> {
        self.parameters.pending(id)
    }

    /// Drop everything queued for the next block.
    pub fn clear(&self) {
        self.events.clear();
        self.parameters.clear();
    }

    /// Run one block. The pending lists are cleared whatever the outcome.
    pub fn process(
        &mut self,
        processor: &ComPtr<IAudioProcessor>,
        input: [&[f32]; 2],
        output: [&mut [f32]; 2],
        frames: usize,
    ) -> Result<(), ProcessError> {
        let result = self.run(processor, input, output, frames);
        self.clear();
        result
    }

    fn run(
        &mut self,
        processor: &ComPtr<IAudioProcessor>,
        input: [&[f32]; 2],
        output: [&mut [f32]; 2],
        frames: usize,
    ) -> Result<(), ProcessError> {
        if frames > self.max_block_size {
            return Err(ProcessError::BlockTooLarge {
                frames,
                max: self.max_block_size,
            });
        }
        if input.iter().any(|ch| ch.len() < frames) || output.iter().any(|ch| ch.len() < frames) {
            return Err(ProcessError::BufferTooShort { frames });
        }

        let [out_l, out_r] = output;
        // Plugins must not write to input channels.
        let mut input_ptrs: [*mut f32; 2] =
            [input[0].as_ptr() as *mut f32, input[1].as_ptr() as *mut f32];
        let mut output_ptrs: [*mut f32; 2] = [out_l.as_mut_ptr(), out_r.as_mut_ptr()];

        let mut input_bus = AudioBusBuffers {
            numChannels: 2,
            silenceFlags: 0,
            __field0: AudioBusBuffers__type0 {
                channelBuffers32: input_ptrs.as_mut_ptr(),
            },
        };
        let mut output_bus = AudioBusBuffers {
            numChannels: 2,
            silenceFlags: 0,
            __field0: AudioBusBuffers__type0 {
                channelBuffers32: output_ptrs.as_mut_ptr(),
            },
        };

        let input_events = if self.events.is_empty() {
            std::ptr::null_mut()
        } else {
            self.events
                .as_com_ref::<IEventList>()
                .map(|r| r.as_ptr())
                .unwrap_or(std::ptr::null_mut())
        };
        let input_parameters = if self.parameters.is_empty() {
            std::ptr::null_mut()
        } else {
            self.parameters
                .as_com_ref::<IParameterChanges>()
                .map(|r| r.as_ptr())
                .unwrap_or(std::ptr::null_mut())
        };

        let mut context: ProcessContext = unsafe { std::mem::zeroed() };
        context.sampleRate = self.sample_rate;
        context.projectTimeSamples = self.sample_position;

        let mut process_data = ProcessData {
            processMode: kRealtime as i32,
            symbolicSampleSize: kSample32 as i32,
            numSamples: frames as i32,
            numInputs: if self.has_input_bus { 1 } else { 0 },
            numOutputs: 1,
            inputs: if self.has_input_bus {
                &mut input_bus as *mut AudioBusBuffers
            } else {
                std::ptr::null_mut()
            },
            outputs: &mut output_bus,
            inputParameterChanges: input_parameters,
            outputParameterChanges: std::ptr::null_mut(),
            inputEvents: input_events,
            outputEvents: std::ptr::null_mut(),
            processContext: &mut context,
        };

        let result = unsafe { processor.process(&mut process_data) };
        if result != kResultOk {
            return Err(ProcessError::Plugin(result));
        }
        self.sample_position += frames as i64;
        Ok(())
    }
}
