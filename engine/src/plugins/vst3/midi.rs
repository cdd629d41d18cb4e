use midly::MidiMessage;
use midly::live::LiveEvent;
use std::cell::UnsafeCell;
use vst3::Class;
use vst3::Steinberg::Vst::Event_::EventFlags_::kIsLive;
use vst3::Steinberg::Vst::Event_::EventTypes_::{kNoteOffEvent, kNoteOnEvent};
use vst3::Steinberg::Vst::{Event, Event__type0, IEventList, IEventListTrait, NoteOffEvent, NoteOnEvent};
use vst3::Steinberg::{int32, kInvalidArgument, kResultFalse, kResultOk, tresult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiEventKind {
    NoteOn,
    NoteOff,
    /// Accepted but not forwarded; controllers reach plugins as parameters.
    ControlChange,
}

impl TryFrom<i32> for MidiEventKind {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::NoteOn),
            1 => Ok(Self::NoteOff),
            2 => Ok(Self::ControlChange),
            other => Err(format!("Unknown MIDI event type {other}")),
        }
    }
}

/// A host-level MIDI request before conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiRequest {
    pub kind: MidiEventKind,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
}

impl MidiRequest {
    pub fn new(kind: MidiEventKind, channel: u8, data1: u8, data2: u8) -> Result<Self, String> {
        if channel > 15 {
            return Err(format!("MIDI channel {channel} out of range 0-15"));
        }
        if data1 > 127 || data2 > 127 {
            return Err(format!("MIDI data bytes out of range ({data1}, {data2})"));
        }
        Ok(Self {
            kind,
            channel,
            data1,
            data2,
        })
    }

    /// Parse a raw MIDI 1.0 channel message. A note-on with zero velocity is
    /// reported as a note-off; messages other than notes and controllers
    /// yield `None`.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, String> {
        let event = LiveEvent::parse(bytes).map_err(|e| format!("Invalid MIDI message: {e}"))?;
        let LiveEvent::Midi { channel, message } = event else {
            return Ok(None);
        };
        let channel = channel.as_int();
        let request = match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => {
                Self::new(MidiEventKind::NoteOff, channel, key.as_int(), 0)?
            }
            MidiMessage::NoteOn { key, vel } => {
                Self::new(MidiEventKind::NoteOn, channel, key.as_int(), vel.as_int())?
            }
            MidiMessage::NoteOff { key, vel } => {
                Self::new(MidiEventKind::NoteOff, channel, key.as_int(), vel.as_int())?
            }
            MidiMessage::Controller { controller, value } => Self::new(
                MidiEventKind::ControlChange,
                channel,
                controller.as_int(),
                value.as_int(),
            )?,
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    /// The native event for note requests, `None` for controllers.
    pub fn to_event(&self, sample_offset: i32) -> Option<Event> {
        let channel = self.channel as i16;
        let pitch = self.data1 as i16;
        let velocity = self.data2 as f32 / 127.0;
        match self.kind {
            MidiEventKind::NoteOn => Some(make_note_on(channel, pitch, velocity, sample_offset)),
            MidiEventKind::NoteOff => Some(make_note_off(channel, pitch, velocity, sample_offset)),
            MidiEventKind::ControlChange => None,
        }
    }
}

fn make_note_on(channel: i16, pitch: i16, velocity: f32, sample_offset: i32) -> Event {
    Event {
        busIndex: 0,
        sampleOffset: sample_offset,
        ppqPosition: 0.0,
        flags: kIsLive as u16,
        r#type: kNoteOnEvent as u16,
        __field0: Event__type0 {
            noteOn: NoteOnEvent {
                channel,
                pitch,
                tuning: 0.0,
                velocity,
                length: 0,
                noteId: -1,
            },
        },
    }
}

fn make_note_off(channel: i16, pitch: i16, velocity: f32, sample_offset: i32) -> Event {
    Event {
        busIndex: 0,
        sampleOffset: sample_offset,
        ppqPosition: 0.0,
        flags: kIsLive as u16,
        r#type: kNoteOffEvent as u16,
        __field0: Event__type0 {
            noteOff: NoteOffEvent {
                channel,
                pitch,
                velocity,
                noteId: -1,
                tuning: 0.0,
            },
        },
    }
}

/// Bounded per-block input event list.
///
/// Storage is reserved up front; pushing never reallocates. The type is not
/// `Sync`, and the owning instance only mutates it while no `process` call
/// is in flight.
pub struct EventList {
    events: UnsafeCell<Vec<Event>>,
    capacity: usize,
}

impl EventList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: UnsafeCell::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.events.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, event: Event) -> Result<(), String> {
        let events = unsafe { &mut *self.events.get() };
        if events.len() >= self.capacity {
            return Err(format!("MIDI queue full ({} events)", self.capacity));
        }
        events.push(event);
        Ok(())
    }

    pub fn clear(&self) {
        unsafe { (*self.events.get()).clear() };
    }
}

impl Class for EventList {
    type Interfaces = (IEventList,);
}

impl IEventListTrait for EventList {
    unsafe fn getEventCount(&self) -> int32 {
        self.len() as int32
    }

    unsafe fn getEvent(&self, index: int32, e: *mut Event) -> tresult {
        if e.is_null() || index < 0 {
            return kInvalidArgument;
        }
        let events = unsafe { &*self.events.get() };
        match events.get(index as usize) {
            Some(event) => {
                unsafe { *e = *event };
                kResultOk
            }
            None => kResultFalse,
        }
    }

    // Input-only list.
    unsafe fn addEvent(&self, _e: *mut Event) -> tresult {
        kResultFalse
    }
}
