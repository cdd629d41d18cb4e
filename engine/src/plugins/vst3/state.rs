use byteorder::{ByteOrder, LittleEndian};
use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use vst3::Steinberg::{IBStream, IBStreamTrait, kInvalidArgument, kResultFalse, kResultOk, tresult};
use vst3::{Class, ComWrapper};

/// Size of the `[processor len][controller len]` header.
pub const HEADER_LEN: usize = 8;

/// Largest size a `MemoryStream` may reach; stream byte counts are `i32`.
const MAX_STREAM_LEN: usize = i32::MAX as usize;

/// Host framing around the two opaque plugin states.
///
/// Layout: `u32 processor_len`, `u32 controller_len` (little-endian), then
/// the processor bytes, then the controller bytes. There is no version
/// field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateBlob<'a> {
    pub processor: &'a [u8],
    pub controller: &'a [u8],
}

impl<'a> StateBlob<'a> {
    pub fn new(processor: &'a [u8], controller: &'a [u8]) -> Self {
        Self {
            processor,
            controller,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.processor.len() + self.controller.len()
    }

    /// Write the framed blob into `out`, returning the number of bytes used.
    pub fn write_to(&self, out: &mut [u8]) -> Result<usize, String> {
        let total = self.encoded_len();
        if out.len() < total {
            return Err(format!(
                "State buffer too small: need {} bytes, have {}",
                total,
                out.len()
            ));
        }
        let processor_len = u32::try_from(self.processor.len())
            .map_err(|_| "Processor state exceeds 4 GiB".to_string())?;
        let controller_len = u32::try_from(self.controller.len())
            .map_err(|_| "Controller state exceeds 4 GiB".to_string())?;

        LittleEndian::write_u32(&mut out[0..4], processor_len);
        LittleEndian::write_u32(&mut out[4..8], controller_len);
        let split = HEADER_LEN + self.processor.len();
        out[HEADER_LEN..split].copy_from_slice(self.processor);
        out[split..total].copy_from_slice(self.controller);
        Ok(total)
    }

    pub fn encode(&self) -> Result<Vec<u8>, String> {
        let mut out = vec![0u8; self.encoded_len()];
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Validate the header against `data` and borrow both sections.
    pub fn decode(data: &'a [u8]) -> Result<Self, String> {
        if data.len() < HEADER_LEN {
            return Err(format!(
                "State blob too short: {} bytes, header needs {}",
                data.len(),
                HEADER_LEN
            ));
        }
        let processor_len = LittleEndian::read_u32(&data[0..4]) as u64;
        let controller_len = LittleEndian::read_u32(&data[4..8]) as u64;
        let total = HEADER_LEN as u64 + processor_len + controller_len;
        if total > data.len() as u64 {
            return Err(format!(
                "State blob header declares {} bytes but only {} are present",
                total,
                data.len()
            ));
        }
        let split = HEADER_LEN + processor_len as usize;
        Ok(Self {
            processor: &data[HEADER_LEN..split],
            controller: &data[split..split + controller_len as usize],
        })
    }
}

/// Growable in-memory `IBStream` used to move state in and out of plugins.
///
/// Only ever used from one thread at a time; the interior cells back the
/// `&self` COM methods.
#[derive(Default)]
pub struct MemoryStream {
    data: UnsafeCell<Vec<u8>>,
    position: Cell<usize>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: UnsafeCell::new(data.to_vec()),
            position: Cell::new(0),
        }
    }

    /// Wrap in a COM object ready to hand to a plugin.
    pub fn into_com(self) -> ComWrapper<Self> {
        ComWrapper::new(self)
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.data.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.position.get()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        unsafe { (*self.data.get()).clone() }
    }

    pub fn take_bytes(&self) -> Vec<u8> {
        self.position.set(0);
        unsafe { std::mem::take(&mut *self.data.get()) }
    }
}

impl Class for MemoryStream {
    type Interfaces = (IBStream,);
}

impl IBStreamTrait for MemoryStream {
    unsafe fn read(&self, buffer: *mut c_void, num_bytes: i32, num_bytes_read: *mut i32) -> tresult {
        if buffer.is_null() || num_bytes < 0 {
            return kInvalidArgument;
        }

        let data = unsafe { &*self.data.get() };
        let position = self.position.get();
        let available = data.len().saturating_sub(position);
        let actual_read = (num_bytes as usize).min(available);

        if actual_read > 0 {
            let src = &data[position..position + actual_read];
            let dst = unsafe { std::slice::from_raw_parts_mut(buffer as *mut u8, actual_read) };
            dst.copy_from_slice(src);
            self.position.set(position + actual_read);
        }

        // End of stream is a short read, not an error.
        if !num_bytes_read.is_null() {
            unsafe { *num_bytes_read = actual_read as i32 };
        }
        kResultOk
    }

    unsafe fn write(&self, buffer: *mut c_void, num_bytes: i32, num_bytes_written: *mut i32) -> tresult {
        if buffer.is_null() || num_bytes < 0 {
            return kInvalidArgument;
        }

        let count = num_bytes as usize;
        let src = unsafe { std::slice::from_raw_parts(buffer as *const u8, count) };
        let data = unsafe { &mut *self.data.get() };
        let position = self.position.get();

        let Some(required_len) = position
            .checked_add(count)
            .filter(|&len| len <= MAX_STREAM_LEN)
        else {
            return kResultFalse;
        };
        if required_len > data.len() {
            data.resize(required_len, 0);
        }
        data[position..required_len].copy_from_slice(src);
        self.position.set(required_len);

        if !num_bytes_written.is_null() {
            unsafe { *num_bytes_written = num_bytes };
        }
        kResultOk
    }

    unsafe fn seek(&self, pos: i64, mode: i32, result: *mut i64) -> tresult {
        let base = match mode {
            0 => 0,                          // kIBSeekSet
            1 => self.position.get() as i64, // kIBSeekCur
            2 => self.len() as i64,          // kIBSeekEnd
            _ => return kResultFalse,
        };
        let new_position = base.saturating_add(pos).max(0);
        if new_position > MAX_STREAM_LEN as i64 {
            return kResultFalse;
        }
        self.position.set(new_position as usize);

        if !result.is_null() {
            unsafe { *result = new_position };
        }
        kResultOk
    }

    unsafe fn tell(&self, pos: *mut i64) -> tresult {
        if pos.is_null() {
            return kInvalidArgument;
        }
        unsafe { *pos = self.position.get() as i64 };
        kResultOk
    }
}
