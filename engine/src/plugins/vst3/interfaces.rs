// Host-side COM objects handed to plugins.
//
// Everything a plugin may call back into lives here: the application
// context passed to `initialize`, the component handler shared by every
// controller, and the message/attribute objects plugins create through the
// application context to talk across a component/controller connection.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::debug;
use vst3::Steinberg::Vst::{
    IAttributeList, IAttributeListTrait, IComponentHandler, IComponentHandlerTrait,
    IHostApplication, IHostApplicationTrait, IMessage, IMessageTrait, ParamID, ParamValue,
    String128, TChar,
};
use vst3::Steinberg::{FIDString, TUID, int32, kInvalidArgument, kResultFalse, kResultOk, tresult};
use vst3::{Class, ComPtr, ComWrapper, Interface};

/// Convert an interface `Guid` into the `TUID` layout `createInstance` expects.
pub fn guid_to_tuid(guid: &vst3::com_scrape_types::Guid) -> TUID {
    let mut tuid: TUID = [0; 16];
    for (dst, src) in tuid.iter_mut().zip(guid.iter()) {
        *dst = *src as c_char;
    }
    tuid
}

pub fn tuid_to_hex(tuid: &TUID) -> String {
    tuid.iter().map(|&b| format!("{:02X}", b as u8)).collect()
}

pub fn extract_cstring(bytes: &[c_char]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    let u8_bytes: Vec<u8> = bytes[..len].iter().map(|&b| b as u8).collect();
    String::from_utf8_lossy(&u8_bytes).to_string()
}

pub fn string128_to_string(s: &String128) -> String {
    let end = s.iter().position(|&c| c == 0).unwrap_or(s.len());
    String::from_utf16_lossy(&s[..end])
}

pub fn copy_to_string128(src: &str, dst: &mut String128) {
    dst.fill(0);
    for (slot, unit) in dst.iter_mut().zip(src.encode_utf16().take(127)) {
        *slot = unit;
    }
}

/// Length of a null-terminated UTF-16 string.
///
/// # Safety
/// `ptr` must point at a readable, null-terminated `TChar` sequence.
unsafe fn wide_len(ptr: *const TChar) -> usize {
    let mut len = 0;
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
    }
    len
}

/// Hand out an owned reference to a plugin without releasing it here.
fn into_raw<I: Interface>(ptr: ComPtr<I>) -> *mut I {
    let raw = ptr.as_ptr();
    std::mem::forget(ptr);
    raw
}

pub struct HostApplication {
    name: String,
}

impl HostApplication {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Class for HostApplication {
    type Interfaces = (IHostApplication,);
}

impl IHostApplicationTrait for HostApplication {
    unsafe fn getName(&self, name: *mut String128) -> tresult {
        if name.is_null() {
            return kInvalidArgument;
        }
        unsafe { copy_to_string128(&self.name, &mut *name) };
        kResultOk
    }

    unsafe fn createInstance(
        &self,
        cid: *mut TUID,
        iid: *mut TUID,
        obj: *mut *mut c_void,
    ) -> tresult {
        if cid.is_null() || iid.is_null() || obj.is_null() {
            return kInvalidArgument;
        }
        let (cid, iid) = unsafe { (*cid, *iid) };
        unsafe { *obj = std::ptr::null_mut() };

        let message = guid_to_tuid(&IMessage::IID);
        let attributes = guid_to_tuid(&IAttributeList::IID);
        let created = if cid == message && iid == message {
            ComWrapper::new(HostMessage::new())
                .to_com_ptr::<IMessage>()
                .map(|ptr| into_raw(ptr) as *mut c_void)
        } else if cid == attributes && iid == attributes {
            ComWrapper::new(HostAttributeList::new())
                .to_com_ptr::<IAttributeList>()
                .map(|ptr| into_raw(ptr) as *mut c_void)
        } else {
            None
        };

        match created {
            Some(ptr) => {
                unsafe { *obj = ptr };
                kResultOk
            }
            None => {
                debug!("Host createInstance for unsupported class {}", tuid_to_hex(&cid));
                kResultFalse
            }
        }
    }
}

/// Process-wide sink for controller notifications.
///
/// Edits are only logged. Restart requests are accumulated until the owner
/// of the host drains them with `take_restart_flags`.
#[derive(Default)]
pub struct ComponentHandler {
    restart_flags: AtomicI32,
}

impl ComponentHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_restart_flags(&self) -> i32 {
        self.restart_flags.load(Ordering::Acquire)
    }

    pub fn take_restart_flags(&self) -> i32 {
        self.restart_flags.swap(0, Ordering::AcqRel)
    }
}

impl Class for ComponentHandler {
    type Interfaces = (IComponentHandler,);
}

impl IComponentHandlerTrait for ComponentHandler {
    unsafe fn beginEdit(&self, id: ParamID) -> tresult {
        debug!("VST3 beginEdit {id}");
        kResultOk
    }

    unsafe fn performEdit(&self, id: ParamID, value_normalized: ParamValue) -> tresult {
        debug!("VST3 performEdit {id} = {value_normalized}");
        kResultOk
    }

    unsafe fn endEdit(&self, id: ParamID) -> tresult {
        debug!("VST3 endEdit {id}");
        kResultOk
    }

    unsafe fn restartComponent(&self, flags: int32) -> tresult {
        debug!("VST3 plugin requested restart (flags: {flags:#x})");
        self.restart_flags.fetch_or(flags, Ordering::AcqRel);
        kResultOk
    }
}

pub struct HostMessage {
    id: Mutex<Option<CString>>,
    attributes: ComWrapper<HostAttributeList>,
}

impl HostMessage {
    pub fn new() -> Self {
        Self {
            id: Mutex::new(None),
            attributes: ComWrapper::new(HostAttributeList::new()),
        }
    }
}

impl Default for HostMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl Class for HostMessage {
    type Interfaces = (IMessage,);
}

impl IMessageTrait for HostMessage {
    unsafe fn getMessageID(&self) -> FIDString {
        match self.id.lock() {
            Ok(id) => id.as_ref().map_or(std::ptr::null(), |id| id.as_ptr()),
            Err(_) => std::ptr::null(),
        }
    }

    unsafe fn setMessageID(&self, id: FIDString) {
        let value = if id.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(id) }.to_owned())
        };
        if let Ok(mut slot) = self.id.lock() {
            *slot = value;
        }
    }

    // Not add-ref'd: the message owns its attribute list.
    unsafe fn getAttributes(&self) -> *mut IAttributeList {
        self.attributes
            .as_com_ref::<IAttributeList>()
            .map_or(std::ptr::null_mut(), |list| list.as_ptr())
    }
}

#[derive(Clone, Debug, PartialEq)]
enum AttrValue {
    Int(i64),
    Float(f64),
    String(Vec<u16>),
    Binary(Vec<u8>),
}

#[derive(Default)]
pub struct HostAttributeList {
    values: Mutex<HashMap<String, AttrValue>>,
}

impl HostAttributeList {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(id: *const c_char) -> Option<String> {
        if id.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(id) }.to_string_lossy().into_owned())
    }

    fn set(&self, id: *const c_char, value: AttrValue) -> tresult {
        let Some(key) = Self::key(id) else {
            return kInvalidArgument;
        };
        match self.values.lock() {
            Ok(mut values) => {
                values.insert(key, value);
                kResultOk
            }
            Err(_) => kResultFalse,
        }
    }

    fn with_value<R>(&self, id: *const c_char, f: impl FnOnce(&AttrValue) -> Option<R>) -> Option<R> {
        let key = Self::key(id)?;
        let values = self.values.lock().ok()?;
        values.get(&key).and_then(f)
    }
}

impl Class for HostAttributeList {
    type Interfaces = (IAttributeList,);
}

impl IAttributeListTrait for HostAttributeList {
    unsafe fn setInt(&self, id: *const c_char, value: i64) -> tresult {
        self.set(id, AttrValue::Int(value))
    }

    unsafe fn getInt(&self, id: *const c_char, value: *mut i64) -> tresult {
        if value.is_null() {
            return kInvalidArgument;
        }
        match self.with_value(id, |v| match v {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }) {
            Some(found) => {
                unsafe { *value = found };
                kResultOk
            }
            None => kResultFalse,
        }
    }

    unsafe fn setFloat(&self, id: *const c_char, value: f64) -> tresult {
        self.set(id, AttrValue::Float(value))
    }

    unsafe fn getFloat(&self, id: *const c_char, value: *mut f64) -> tresult {
        if value.is_null() {
            return kInvalidArgument;
        }
        match self.with_value(id, |v| match v {
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }) {
            Some(found) => {
                unsafe { *value = found };
                kResultOk
            }
            None => kResultFalse,
        }
    }

    unsafe fn setString(&self, id: *const c_char, string: *const TChar) -> tresult {
        if string.is_null() {
            return kInvalidArgument;
        }
        let units = unsafe { std::slice::from_raw_parts(string, wide_len(string)) }.to_vec();
        self.set(id, AttrValue::String(units))
    }

    unsafe fn getString(&self, id: *const c_char, string: *mut TChar, size_in_bytes: u32) -> tresult {
        let capacity = size_in_bytes as usize / std::mem::size_of::<TChar>();
        if string.is_null() || capacity == 0 {
            return kInvalidArgument;
        }
        let Some(units) = self.with_value(id, |v| match v {
            AttrValue::String(s) => Some(s.clone()),
            _ => None,
        }) else {
            return kResultFalse;
        };
        let count = units.len().min(capacity - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(units.as_ptr(), string, count);
            *string.add(count) = 0;
        }
        kResultOk
    }

    unsafe fn setBinary(&self, id: *const c_char, data: *const c_void, size_in_bytes: u32) -> tresult {
        let bytes = if size_in_bytes == 0 {
            Vec::new()
        } else if data.is_null() {
            return kInvalidArgument;
        } else {
            unsafe { std::slice::from_raw_parts(data as *const u8, size_in_bytes as usize) }.to_vec()
        };
        self.set(id, AttrValue::Binary(bytes))
    }

    // The returned pointer stays valid until the attribute is overwritten.
    unsafe fn getBinary(
        &self,
        id: *const c_char,
        data: *mut *const c_void,
        size_in_bytes: *mut u32,
    ) -> tresult {
        if data.is_null() || size_in_bytes.is_null() {
            return kInvalidArgument;
        }
        match self.with_value(id, |v| match v {
            AttrValue::Binary(b) => Some((b.as_ptr() as *const c_void, b.len() as u32)),
            _ => None,
        }) {
            Some((ptr, len)) => {
                unsafe {
                    *data = ptr;
                    *size_in_bytes = len;
                }
                kResultOk
            }
            None => kResultFalse,
        }
    }
}
