//! Program and map type codes

use serde::{Deserialize, Serialize};

/// Kind of program, which decides where it may attach and what it may call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ProgramType {
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    TracePoint = 5,
    Xdp = 6,
}

impl ProgramType {
    /// Returns the kernel's numeric code
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Maps a numeric code back to a known type
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::SocketFilter),
            2 => Some(Self::Kprobe),
            3 => Some(Self::SchedCls),
            4 => Some(Self::SchedAct),
            5 => Some(Self::TracePoint),
            6 => Some(Self::Xdp),
            _ => None,
        }
    }
}

/// Kind of map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MapType {
    Hash = 1,
    Array = 2,
    PerCpuHash = 5,
    PerCpuArray = 6,
    LruHash = 9,
    ArrayOfMaps = 12,
    HashOfMaps = 13,
}

impl MapType {
    /// Returns the kernel's numeric code
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Maps a numeric code back to a known type
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Hash),
            2 => Some(Self::Array),
            5 => Some(Self::PerCpuHash),
            6 => Some(Self::PerCpuArray),
            9 => Some(Self::LruHash),
            12 => Some(Self::ArrayOfMaps),
            13 => Some(Self::HashOfMaps),
            _ => None,
        }
    }

    /// Whether values of this map are handles of other maps
    pub const fn has_inner_map(self) -> bool {
        matches!(self, Self::ArrayOfMaps | Self::HashOfMaps)
    }

    /// Whether keys are dense indices rather than hashed values
    pub const fn is_array(self) -> bool {
        matches!(self, Self::Array | Self::PerCpuArray | Self::ArrayOfMaps)
    }
}
