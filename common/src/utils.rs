//! Common Utilities
//!
//! Pairing functions, dB conversions and slot timing helpers used across the crates

/// Cantor pairing function, used to key per-(BWP, RNTI) state in a flat map
pub fn cantor(x1: u16, x2: u16) -> u64 {
    let (a, b) = (x1 as u64, x2 as u64);
    ((a + b) * (a + b + 1)) / 2 + b
}

/// Convert a linear power ratio to dB
pub fn linear_to_db(linear: f64) -> f64 {
    10.0 * linear.log10()
}

/// Convert dB to a linear power ratio
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Time utilities for slot/frame calculations
pub mod time {
    /// Slot duration in microseconds for a numerology
    pub fn slot_duration_us(numerology: u8) -> u32 {
        1000 >> numerology.min(4)
    }

    /// Number of slots per second
    pub fn slots_per_second(numerology: u8) -> u32 {
        1000 << numerology.min(4)
    }

    /// Number of slots per frame (10ms)
    pub fn slots_per_frame(numerology: u8) -> u16 {
        10 << numerology.min(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cantor_pairing() {
        assert_eq!(cantor(0, 0), 0);
        assert_eq!(cantor(1, 0), 1);
        assert_eq!(cantor(0, 1), 2);
        assert_eq!(cantor(2, 3), 18);
        assert_ne!(cantor(0, 1), cantor(1, 0));
    }

    #[test]
    fn test_db_conversion() {
        assert!((db_to_linear(10.0) - 10.0).abs() < 1e-12);
        assert!((linear_to_db(100.0) - 20.0).abs() < 1e-12);
        assert!((db_to_linear(linear_to_db(3.7)) - 3.7).abs() < 1e-12);
    }

    #[test]
    fn test_slot_duration() {
        assert_eq!(time::slot_duration_us(0), 1000);
        assert_eq!(time::slot_duration_us(1), 500);
        assert_eq!(time::slot_duration_us(3), 125);
        assert_eq!(time::slots_per_second(2), 4000);
        assert_eq!(time::slots_per_frame(1), 20);
    }
}
