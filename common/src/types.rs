//! Common Types for the NR MAC Scheduling Core
//!
//! Defines fundamental identifiers and radio timing types shared by every crate

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Errors raised when building radio types from raw values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid numerology: {0}")]
    InvalidNumerology(u8),

    #[error("Invalid subcarrier spacing: {0} kHz")]
    InvalidScs(u16),

    #[error("Invalid slot index {slot} for numerology {numerology}")]
    InvalidSlot { slot: u8, numerology: u8 },
}

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Bandwidth part identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BwpId(pub u16);

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Build from a value in kHz
    pub fn from_khz(khz: u16) -> Result<Self, TypeError> {
        Self::from_u16(khz).ok_or(TypeError::InvalidScs(khz))
    }

    /// Build from the numerology index (mu)
    pub fn from_numerology(numerology: u8) -> Result<Self, TypeError> {
        match numerology {
            0 => Ok(Self::Scs15),
            1 => Ok(Self::Scs30),
            2 => Ok(Self::Scs60),
            3 => Ok(Self::Scs120),
            4 => Ok(Self::Scs240),
            n => Err(TypeError::InvalidNumerology(n)),
        }
    }

    /// Numerology index (mu) of this spacing
    pub fn numerology(&self) -> u8 {
        match self {
            Self::Scs15 => 0,
            Self::Scs30 => 1,
            Self::Scs60 => 2,
            Self::Scs120 => 3,
            Self::Scs240 => 4,
        }
    }

    /// Spacing in kHz
    pub fn khz(&self) -> u16 {
        *self as u16
    }
}

/// Duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplexMode {
    /// Frequency Division Duplex
    Fdd,
    /// Time Division Duplex
    Tdd,
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    Downlink,
    Uplink,
}

/// 5G QoS Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qci(pub u8);

impl Qci {
    /// Conversational voice
    pub const VOICE: Self = Self(1);
    /// Conversational video
    pub const VIDEO: Self = Self(2);
    /// Default bearer
    pub const DEFAULT: Self = Self(9);

    /// Default priority level from TS 23.501 Table 5.7.4-1 (lower is more important)
    pub fn priority_level(&self) -> u8 {
        match self.0 {
            1 => 20,
            2 => 40,
            3 => 30,
            4 => 50,
            5 => 10,
            6 => 60,
            7 => 70,
            8 => 80,
            9 => 90,
            65 => 7,
            66 => 20,
            67 => 15,
            69 => 5,
            70 => 55,
            75 => 25,
            79 => 65,
            80 => 68,
            82 => 19,
            83 => 22,
            84 => 24,
            85 => 21,
            _ => 90,
        }
    }

    /// Whether this 5QI carries a guaranteed bit rate
    pub fn is_gbr(&self) -> bool {
        matches!(self.0, 1..=4 | 65..=67 | 75 | 82..=85)
    }

    /// Packet delay budget in milliseconds
    pub fn packet_delay_budget_ms(&self) -> u32 {
        match self.0 {
            1 => 100,
            2 => 150,
            3 => 50,
            4 => 300,
            5 => 100,
            65 | 66 => 75,
            67 => 100,
            69 => 60,
            70 => 200,
            75 => 50,
            79 => 50,
            80 => 10,
            82 | 83 => 10,
            84 | 85 => 30,
            _ => 300,
        }
    }
}

impl Default for Qci {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// System frame number and slot position
///
/// Frames are not wrapped at 1024 so that the ordering stays total over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SfnSf {
    /// Frame number
    pub frame: u32,
    /// Subframe inside the frame (0-9)
    pub subframe: u8,
    /// Slot inside the subframe
    pub slot: u8,
    /// Numerology (mu)
    pub numerology: u8,
}

impl SfnSf {
    /// Subframes per frame
    pub const SUBFRAMES_PER_FRAME: u8 = 10;

    /// Create a new position, validating the numerology and slot index
    pub fn new(frame: u32, subframe: u8, slot: u8, numerology: u8) -> Result<Self, TypeError> {
        if numerology > 4 {
            return Err(TypeError::InvalidNumerology(numerology));
        }
        if slot >= (1u8 << numerology) || subframe >= Self::SUBFRAMES_PER_FRAME {
            return Err(TypeError::InvalidSlot { slot, numerology });
        }
        Ok(Self { frame, subframe, slot, numerology })
    }

    /// First slot of frame 0
    pub fn origin(numerology: u8) -> Result<Self, TypeError> {
        Self::new(0, 0, 0, numerology)
    }

    /// Slots per subframe for this numerology
    pub fn slots_per_subframe(&self) -> u32 {
        1u32 << self.numerology
    }

    /// Slots per frame for this numerology
    pub fn slots_per_frame(&self) -> u32 {
        self.slots_per_subframe() * Self::SUBFRAMES_PER_FRAME as u32
    }

    /// Absolute slot index since frame 0
    pub fn normalized(&self) -> u64 {
        self.frame as u64 * self.slots_per_frame() as u64
            + self.subframe as u64 * self.slots_per_subframe() as u64
            + self.slot as u64
    }

    /// Rebuild a position from an absolute slot index
    pub fn from_normalized(index: u64, numerology: u8) -> Result<Self, TypeError> {
        if numerology > 4 {
            return Err(TypeError::InvalidNumerology(numerology));
        }
        let sps = 1u64 << numerology;
        let spf = sps * Self::SUBFRAMES_PER_FRAME as u64;
        Ok(Self {
            frame: (index / spf) as u32,
            subframe: ((index % spf) / sps) as u8,
            slot: (index % sps) as u8,
            numerology,
        })
    }

    /// Position `n` slots later
    pub fn add_slots(&self, n: u64) -> Self {
        let sps = self.slots_per_subframe() as u64;
        let spf = sps * Self::SUBFRAMES_PER_FRAME as u64;
        let index = self.normalized() + n;
        Self {
            frame: (index / spf) as u32,
            subframe: ((index % spf) / sps) as u8,
            slot: (index % sps) as u8,
            numerology: self.numerology,
        }
    }

    /// The following slot
    pub fn next(&self) -> Self {
        self.add_slots(1)
    }

    /// Slot index inside the frame
    pub fn slot_in_frame(&self) -> u32 {
        self.subframe as u32 * self.slots_per_subframe() + self.slot as u32
    }
}

impl PartialOrd for SfnSf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SfnSf {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.frame, self.subframe, self.slot, self.numerology)
            .cmp(&(other.frame, other.subframe, other.slot, other.numerology))
    }
}

impl fmt::Display for SfnSf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.frame, self.subframe, self.slot)
    }
}
