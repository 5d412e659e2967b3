//! Deterministic stand-in interpreter for headless runs.
//!
//! `ScriptedCpu` does not decode firmware. It burns whatever budget the
//! kernel hands it, bumps a counter in mote memory, chatters on its UART
//! and naps between bursts, all driven by a per-mote ChaCha8 stream so a
//! given seed always produces the same run.

use motesim_env::{Architecture, CpuCore, CpuFault, CpuReport, MemoryBus, MoteId, Platform, MILLISECOND};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Default address of the burst counter (inside both platforms' RAM).
pub const COUNTER_ADDRESS: u32 = 0x1100;

/// Name under which the burst counter is exposed as a mote variable.
pub const COUNTER_VARIABLE: &str = "bursts";

/// Offset of the LED byte from the counter.
const LED_OFFSET: u32 = 4;

/// Behaviour knobs shared by every CPU a registry builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Seed mixed with the mote id for each CPU's generator
    pub seed: u64,

    /// Print one UART line every this many bursts (0 = silent)
    pub line_every: u64,

    /// Longest nap between bursts, in milliseconds
    pub max_sleep_ms: u64,

    /// Where the burst counter lives
    pub counter_address: u32,

    /// Mote whose CPU crashes, and after how many cycles
    pub crash: Option<(MoteId, u64)>,

    /// Mote whose CPU hits a breakpoint, and on which burst
    pub breakpoint: Option<(MoteId, u64)>,
}

impl Script {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            line_every: 1,
            max_sleep_ms: 4,
            counter_address: COUNTER_ADDRESS,
            crash: None,
            breakpoint: None,
        }
    }

    pub fn with_line_every(mut self, bursts: u64) -> Self {
        self.line_every = bursts;
        self
    }

    pub fn with_max_sleep_ms(mut self, ms: u64) -> Self {
        self.max_sleep_ms = ms;
        self
    }

    /// Makes `mote` raise an illegal instruction once it has run `cycles`.
    pub fn with_crash(mut self, mote: MoteId, cycles: u64) -> Self {
        self.crash = Some((mote, cycles));
        self
    }

    /// Makes `mote` request a stop on its `burst`-th burst.
    pub fn with_breakpoint(mut self, mote: MoteId, burst: u64) -> Self {
        self.breakpoint = Some((mote, burst));
        self
    }

    /// Address of the LED byte (low three bits of the burst count).
    pub fn led_address(&self) -> u32 {
        self.counter_address + LED_OFFSET
    }

    /// Builds the CPU for one mote.
    pub fn cpu(&self, platform: Platform, mote: MoteId) -> ScriptedCpu {
        let mut cpu = ScriptedCpu::new(platform, mote, self.seed);
        cpu.line_every = self.line_every;
        cpu.max_sleep_ms = self.max_sleep_ms;
        cpu.counter_address = self.counter_address;
        cpu.instruction_cap = self.crash.filter(|(m, _)| *m == mote).map(|(_, c)| c);
        cpu.breakpoint = self.breakpoint.filter(|(m, _)| *m == mote).map(|(_, b)| b);
        cpu
    }
}

pub struct ScriptedCpu {
    platform: Platform,
    mote: MoteId,
    rng: ChaCha8Rng,

    cycles: u64,
    bursts: u64,

    line_every: u64,
    max_sleep_ms: u64,
    counter_address: u32,
    instruction_cap: Option<u64>,
    breakpoint: Option<u64>,
}

impl ScriptedCpu {
    pub fn new(platform: Platform, mote: MoteId, seed: u64) -> Self {
        // Golden-ratio mix keeps neighbouring mote ids on unrelated streams
        let stream = seed ^ (mote.0 as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            platform,
            mote,
            rng: ChaCha8Rng::seed_from_u64(stream),
            cycles: 0,
            bursts: 0,
            line_every: 1,
            max_sleep_ms: 4,
            counter_address: COUNTER_ADDRESS,
            instruction_cap: None,
            breakpoint: None,
        }
    }

    fn pc(&self) -> u32 {
        // Plausible flash address for fault reports
        (0x4000 + (self.cycles % 0x2000) as u32) & !1
    }
}

impl CpuCore for ScriptedCpu {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn run_cycles(&mut self, budget: u64, bus: &mut dyn MemoryBus) -> Result<CpuReport, CpuFault> {
        self.bursts += 1;

        if self.breakpoint == Some(self.bursts) {
            return Err(CpuFault::stop(format!(
                "breakpoint on {} at pc={:#06x}",
                self.mote,
                self.pc()
            )));
        }
        if let Some(cap) = self.instruction_cap {
            if self.cycles + budget > cap {
                self.cycles = cap;
                return Err(CpuFault::IllegalInstruction {
                    pc: self.pc(),
                    opcode: self.rng.gen_range(0xff00..=0xffff),
                });
            }
        }

        self.cycles += budget;
        bus.write_bytes(self.counter_address, &(self.bursts as u32).to_le_bytes())?;
        bus.write_byte(self.counter_address + LED_OFFSET, (self.bursts & 0x07) as u8)?;

        let mut uart = Vec::new();
        if self.line_every > 0 && self.bursts % self.line_every == 0 {
            let reading: u16 = self.rng.gen_range(300..900);
            uart.extend_from_slice(format!("burst {} reading {}\r\n", self.bursts, reading).as_bytes());
        }

        let nap_ms = if self.max_sleep_ms > 0 {
            self.rng.gen_range(0..=self.max_sleep_ms)
        } else {
            0
        };
        let sleeping = nap_ms > 0;

        // Only the MSP430 driver honours wakeups; AVR is polled every millisecond
        let next_wakeup_cycle = match self.platform.architecture() {
            Architecture::Msp430 if sleeping => Some(self.cycles + self.platform.cycles_per(nap_ms * MILLISECOND)),
            _ => None,
        };

        Ok(CpuReport {
            cycles: budget,
            uart,
            sleeping,
            next_wakeup_cycle,
        })
    }

    fn cycle_count(&self) -> u64 {
        self.cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Ram(HashMap<u32, u8>);

    impl MemoryBus for Ram {
        fn read_byte(&self, address: u32) -> Result<u8, CpuFault> {
            self.0.get(&address).copied().ok_or(CpuFault::MemoryAccess { address })
        }

        fn write_byte(&mut self, address: u32, value: u8) -> Result<(), CpuFault> {
            self.0.insert(address, value);
            Ok(())
        }
    }

    fn trace(cpu: &mut ScriptedCpu, runs: usize) -> Vec<CpuReport> {
        let mut ram = Ram::default();
        (0..runs).map(|_| cpu.run_cycles(7372, &mut ram).unwrap()).collect()
    }

    #[test]
    fn test_same_seed_same_run() {
        let a = trace(&mut ScriptedCpu::new(Platform::MicaZ, MoteId(3), 9), 20);
        let b = trace(&mut ScriptedCpu::new(Platform::MicaZ, MoteId(3), 9), 20);
        assert_eq!(a, b);

        let other = trace(&mut ScriptedCpu::new(Platform::MicaZ, MoteId(4), 9), 20);
        assert_ne!(a, other);
    }

    #[test]
    fn test_counter_and_uart() {
        let mut cpu = Script::new(1).with_line_every(2).cpu(Platform::MicaZ, MoteId(1));
        let mut ram = Ram::default();
        let first = cpu.run_cycles(100, &mut ram).unwrap();
        let second = cpu.run_cycles(100, &mut ram).unwrap();

        assert!(first.uart.is_empty());
        assert!(String::from_utf8(second.uart).unwrap().starts_with("burst 2 reading "));
        assert_eq!(ram.0[&COUNTER_ADDRESS], 2);
        assert_eq!(ram.0[&Script::new(1).led_address()], 2);
        assert_eq!(cpu.cycle_count(), 200);
    }

    #[test]
    fn test_avr_never_arms_wakeup() {
        let mut cpu = ScriptedCpu::new(Platform::MicaZ, MoteId(1), 5);
        assert!(trace(&mut cpu, 50).iter().all(|r| r.next_wakeup_cycle.is_none()));
    }

    #[test]
    fn test_msp430_wakeup_is_ahead() {
        let mut cpu = ScriptedCpu::new(Platform::Sky, MoteId(1), 5);
        let mut ram = Ram::default();
        for _ in 0..50 {
            let report = cpu.run_cycles(3900, &mut ram).unwrap();
            if let Some(wakeup) = report.next_wakeup_cycle {
                assert!(report.sleeping);
                assert!(wakeup > cpu.cycle_count());
            }
        }
    }

    #[test]
    fn test_crash_and_breakpoint_target_one_mote() {
        let script = Script::new(1)
            .with_crash(MoteId(2), 250)
            .with_breakpoint(MoteId(3), 2);
        let mut ram = Ram::default();

        let mut healthy = script.cpu(Platform::MicaZ, MoteId(1));
        assert!(healthy.run_cycles(1000, &mut ram).is_ok());

        let mut crashing = script.cpu(Platform::MicaZ, MoteId(2));
        assert!(crashing.run_cycles(200, &mut ram).is_ok());
        let fault = crashing.run_cycles(200, &mut ram).unwrap_err();
        assert!(matches!(fault, CpuFault::IllegalInstruction { .. }));

        let mut stopping = script.cpu(Platform::MicaZ, MoteId(3));
        assert!(stopping.run_cycles(10, &mut ram).is_ok());
        let fault = stopping.run_cycles(10, &mut ram).unwrap_err();
        assert!(fault.is_stop_request());
        assert!(fault.to_string().contains("mote #3"));
    }
}
