//! Common types for the motesim environment abstraction.

use serde::{Deserialize, Serialize};

/// Simulated time, in microseconds since the simulation started.
pub type SimTime = u64;

/// One simulated microsecond.
pub const MICROSECOND: SimTime = 1;

/// One simulated millisecond.
pub const MILLISECOND: SimTime = 1000 * MICROSECOND;

/// One simulated second.
pub const SECOND: SimTime = 1000 * MILLISECOND;

/// Identifier of a mote within one simulation.
///
/// Identity is what the kernel compares; the numeric value is chosen by
/// whoever creates the mote (usually sequentially from 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MoteId(pub u32);

impl MoteId {
    /// Returns the raw numeric id.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for MoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mote #{}", self.0)
    }
}

/// CPU architecture family of an emulated platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Atmel AVR (8-bit)
    Avr,
    /// TI MSP430 (16-bit)
    Msp430,
}

/// Supported hardware platforms.
///
/// This is a closed set: each variant selects both the CPU family and the
/// way the kernel schedules that CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// MicaZ: ATmega128L at 7.3728 MHz
    MicaZ,
    /// Tmote Sky: MSP430F1611 at 3.9 MHz
    Sky,
}

impl Platform {
    /// Returns every supported platform.
    pub fn all() -> Vec<Platform> {
        vec![Platform::MicaZ, Platform::Sky]
    }

    /// Returns the platform name.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::MicaZ => "micaz",
            Platform::Sky => "sky",
        }
    }

    /// Returns the CPU family.
    pub fn architecture(&self) -> Architecture {
        match self {
            Platform::MicaZ => Architecture::Avr,
            Platform::Sky => Architecture::Msp430,
        }
    }

    /// CPU clock frequency in Hz.
    pub fn cpu_frequency_hz(&self) -> u64 {
        match self {
            Platform::MicaZ => 7_372_800,
            Platform::Sky => 3_900_000,
        }
    }

    /// Number of CPU cycles that fit in `duration` microseconds.
    pub fn cycles_per(&self, duration: SimTime) -> u64 {
        // u128 keeps long durations from overflowing
        ((duration as u128 * self.cpu_frequency_hz() as u128) / 1_000_000) as u64
    }

    /// Microseconds needed to execute `cycles` CPU cycles, rounded up.
    pub fn micros_for(&self, cycles: u64) -> SimTime {
        let freq = self.cpu_frequency_hz() as u128;
        ((cycles as u128 * 1_000_000 + freq - 1) / freq) as SimTime
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "micaz" | "avr" => Ok(Platform::MicaZ),
            "sky" | "tmote" | "msp430" => Ok(Platform::Sky),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_units() {
        assert_eq!(MILLISECOND, 1000);
        assert_eq!(SECOND, 1_000_000);
    }

    #[test]
    fn test_platform_cycles() {
        assert_eq!(Platform::MicaZ.cycles_per(MILLISECOND), 7372);
        assert_eq!(Platform::Sky.cycles_per(MILLISECOND), 3900);
        assert_eq!(Platform::Sky.micros_for(3900), MILLISECOND);
        // Rounds up
        assert_eq!(Platform::Sky.micros_for(1), 1);
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("sky".parse::<Platform>(), Ok(Platform::Sky));
        assert_eq!("MicaZ".parse::<Platform>(), Ok(Platform::MicaZ));
        assert_eq!("msp430".parse::<Platform>().map(|p| p.architecture()), Ok(Architecture::Msp430));
        assert!("z1".parse::<Platform>().is_err());
    }

    #[test]
    fn test_mote_id_display() {
        assert_eq!(MoteId(7).to_string(), "mote #7");
    }
}
