//! Slot Pattern
//!
//! Which directions each slot may carry. FDD carriers schedule both
//! directions in every slot; TDD follows a repeating DL/UL/F pattern.

use crate::LayerError;
use common::types::{DuplexMode, SfnSf};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a whole slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotType {
    Dl,
    Ul,
    /// Flexible: both directions share the slot
    F,
}

impl SlotType {
    pub fn has_dl(&self) -> bool {
        matches!(self, SlotType::Dl | SlotType::F)
    }

    pub fn has_ul(&self) -> bool {
        matches!(self, SlotType::Ul | SlotType::F)
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Dl => write!(f, "DL"),
            SlotType::Ul => write!(f, "UL"),
            SlotType::F => write!(f, "F"),
        }
    }
}

/// TDD pattern by slot counts: DL slots, then special (F) slots, then UL slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TddPattern {
    pub dl_slots: u8,
    pub ul_slots: u8,
    pub special_slots: u8,
}

/// Repeating slot pattern of a carrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPattern {
    slots: Vec<SlotType>,
}

impl SlotPattern {
    /// Both directions in every slot
    pub fn fdd() -> Self {
        Self { slots: vec![SlotType::F] }
    }

    pub fn from_tdd(pattern: TddPattern) -> Result<Self, LayerError> {
        let mut slots = Vec::new();
        slots.extend(std::iter::repeat(SlotType::Dl).take(pattern.dl_slots as usize));
        slots.extend(std::iter::repeat(SlotType::F).take(pattern.special_slots as usize));
        slots.extend(std::iter::repeat(SlotType::Ul).take(pattern.ul_slots as usize));
        Self::from_slots(slots)
    }

    pub fn from_slots(slots: Vec<SlotType>) -> Result<Self, LayerError> {
        if slots.is_empty() {
            return Err(LayerError::InvalidConfiguration("empty slot pattern".into()));
        }
        Ok(Self { slots })
    }

    /// Pattern for a duplex mode; TDD requires a pattern description
    pub fn for_duplex(mode: DuplexMode, tdd: Option<&str>) -> Result<Self, LayerError> {
        match (mode, tdd) {
            (DuplexMode::Fdd, _) => Ok(Self::fdd()),
            (DuplexMode::Tdd, Some(desc)) => desc.parse(),
            (DuplexMode::Tdd, None) => Err(LayerError::InvalidConfiguration(
                "TDD carrier without a slot pattern".into()
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot type of an absolute slot position
    pub fn slot_type(&self, sfn: &SfnSf) -> SlotType {
        let idx = (sfn.normalized() % self.slots.len() as u64) as usize;
        self.slots[idx]
    }
}

impl FromStr for SlotPattern {
    type Err = LayerError;

    /// Parse `DL|DL|F|UL|UL`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slots = s
            .split('|')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| match t.to_ascii_uppercase().as_str() {
                "DL" => Ok(SlotType::Dl),
                "UL" => Ok(SlotType::Ul),
                "F" | "S" => Ok(SlotType::F),
                other => Err(LayerError::InvalidConfiguration(format!("unknown slot type '{}'", other))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_slots(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern() {
        let p: SlotPattern = "DL|DL|F|UL".parse().unwrap();
        assert_eq!(p.len(), 4);
        let mut sfn = SfnSf::origin(0).unwrap();
        let types: Vec<SlotType> = (0..6).map(|_| {
            let t = p.slot_type(&sfn);
            sfn = sfn.next();
            t
        }).collect();
        assert_eq!(types, vec![SlotType::Dl, SlotType::Dl, SlotType::F, SlotType::Ul, SlotType::Dl, SlotType::Dl]);
        assert!("DL|XX".parse::<SlotPattern>().is_err());
        assert!("".parse::<SlotPattern>().is_err());
    }

    #[test]
    fn test_duplex_modes() {
        let fdd = SlotPattern::for_duplex(DuplexMode::Fdd, None).unwrap();
        assert_eq!(fdd.slot_type(&SfnSf::origin(1).unwrap()), SlotType::F);
        assert!(SlotPattern::for_duplex(DuplexMode::Tdd, None).is_err());

        let tdd = SlotPattern::from_tdd(TddPattern { dl_slots: 3, ul_slots: 1, special_slots: 1 }).unwrap();
        assert_eq!(tdd.len(), 5);
        assert!(SlotType::F.has_dl() && SlotType::F.has_ul());
        assert!(!SlotType::Ul.has_dl());
    }
}
