use super::interfaces::string128_to_string;
use serde::{Deserialize, Serialize};
use vst3::Steinberg::Vst::BusInfo_::BusFlags_::kDefaultActive;
use vst3::Steinberg::Vst::ParameterInfo_::ParameterFlags_::{kIsReadOnly, kIsBypass};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusInfo {
    pub index: usize,
    pub name: String,
    pub channel_count: usize,
    pub is_default_active: bool,
}

impl BusInfo {
    pub fn from_vst3(index: usize, info: &vst3::Steinberg::Vst::BusInfo) -> Self {
        Self {
            index,
            name: string128_to_string(&info.name),
            channel_count: info.channelCount.max(0) as usize,
            is_default_active: info.flags & kDefaultActive as u32 != 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub id: u32, // VST3 ParamID
    pub title: String,
    pub short_title: String,
    pub units: String,
    pub step_count: i32, // 0 = continuous, >0 = discrete
    pub default_value: f64,
    pub flags: i32, // ParameterFlags (read-only, etc.)
}

impl ParameterInfo {
    pub fn from_vst3(info: &vst3::Steinberg::Vst::ParameterInfo) -> Self {
        Self {
            id: info.id,
            title: string128_to_string(&info.title),
            short_title: string128_to_string(&info.shortTitle),
            units: string128_to_string(&info.units),
            step_count: info.stepCount,
            default_value: info.defaultNormalizedValue,
            flags: info.flags,
        }
    }

    pub fn is_discrete(&self) -> bool {
        self.step_count > 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & kIsReadOnly as i32 != 0
    }

    pub fn is_bypass(&self) -> bool {
        self.flags & kIsBypass as i32 != 0
    }
}
