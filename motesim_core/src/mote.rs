//! Motes and mote types.
//!
//! A [`Mote`] is the kernel's unit of scheduling. It bundles a CPU
//! interpreter, memory and interfaces behind one capability set (`tick`,
//! `interfaces`, `memory`). The CPU is held as a closed, per-platform
//! variant ([`PlatformCpu`]) chosen when the mote is created, since AVR
//! and MSP430 motes are driven differently:
//!
//! | Platform | CPU     | Driving                                              |
//! |----------|---------|------------------------------------------------------|
//! | MicaZ    | AVR     | fixed cycle budget every simulated millisecond       |
//! | Sky      | MSP430  | runs up to the current time, wakes when the CPU asks |
//!
//! Every mote has a clock drift relative to simulation time. A negative
//! mote clock means the mote has not booted yet.

use crate::error::ConfigError;
use crate::event_queue::EventId;
use crate::interfaces::{LedBank, LogOutput, MoteClock, MoteInterface, MoteInterfaceHandler, PollContext};
use crate::memory::MoteMemory;
use crate::registry::Registry;
use motesim_env::{Architecture, CpuCore, CpuFault, MoteId, Platform, SimTime, MILLISECOND};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Power state of a mote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoteState {
    /// Awake: all interfaces are polled
    Active,
    /// CPU sleeping: passive interfaces only
    LowPower,
    /// Never ticked again
    Dead,
}

/// Interfaces a mote type equips its motes with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceSpec {
    Clock,
    LogOutput,
    Leds { address: u32 },
}

impl InterfaceSpec {
    fn build(&self) -> Box<dyn MoteInterface> {
        match self {
            InterfaceSpec::Clock => Box::new(MoteClock::new()),
            InterfaceSpec::LogOutput => Box::new(LogOutput::new()),
            InterfaceSpec::Leds { address } => Box::new(LedBank::new(*address)),
        }
    }
}

/// Template shared by motes running the same firmware on the same platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoteType {
    identifier: String,
    description: String,
    platform: Platform,
    variables: BTreeMap<String, u32>,
    ram_start: u32,
    ram_size: usize,
    interfaces: Vec<InterfaceSpec>,
}

impl MoteType {
    /// Creates a mote type with the platform's default RAM window and a
    /// clock plus log output.
    pub fn new(identifier: impl Into<String>, platform: Platform) -> Self {
        let (ram_start, ram_size) = match platform.architecture() {
            Architecture::Avr => (0x0100, 4 * 1024),
            Architecture::Msp430 => (0x1100, 10 * 1024),
        };
        let identifier = identifier.into();
        Self {
            description: format!("{} mote type {}", platform, identifier),
            identifier,
            platform,
            variables: BTreeMap::new(),
            ram_start,
            ram_size,
            interfaces: vec![InterfaceSpec::Clock, InterfaceSpec::LogOutput],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a firmware symbol.
    pub fn with_variable(mut self, name: impl Into<String>, address: u32) -> Self {
        self.variables.insert(name.into(), address);
        self
    }

    pub fn with_ram(mut self, start: u32, size: usize) -> Self {
        self.ram_start = start;
        self.ram_size = size;
        self
    }

    pub fn with_interface(mut self, interface: InterfaceSpec) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn interfaces(&self) -> &[InterfaceSpec] {
        &self.interfaces
    }

    /// Instantiates a mote of this type.
    ///
    /// # Errors
    /// `ConfigError::UnknownPlatform` if the registry has no interpreter for
    /// the platform.
    pub fn create_mote(self: &Arc<Self>, registry: &Registry, id: MoteId) -> Result<Mote, ConfigError> {
        let cpu = registry.create_cpu(self.platform, id)?;
        if cpu.platform() != self.platform {
            return Err(ConfigError::UnknownPlatform(format!(
                "{} (registry built a {} interpreter)",
                self.platform,
                cpu.platform()
            )));
        }

        let memory = MoteMemory::new(self.variables.clone()).with_ram(self.ram_start, self.ram_size);
        let mut interfaces = MoteInterfaceHandler::new(true);
        for spec in &self.interfaces {
            interfaces.add(spec.build());
        }

        Ok(Mote::new(id, Arc::clone(self), cpu, memory, interfaces))
    }
}

/// Result of one CPU execution, as seen by the mote.
struct Execution {
    uart: Vec<u8>,
    sleeping: bool,
    /// Mote-clock microseconds until the CPU next needs service (>= 1)
    delay: SimTime,
}

/// AVR: fixed budget per millisecond.
pub struct AvrCpu {
    core: Box<dyn CpuCore>,
    budget: u64,
}

/// MSP430: catches up to the mote clock and honours the CPU's wakeup.
pub struct Msp430Cpu {
    core: Box<dyn CpuCore>,
    last_execute: i64,
    sleeping: bool,
    next_wakeup_cycle: Option<u64>,
}

/// Per-platform CPU driver.
pub enum PlatformCpu {
    Avr(AvrCpu),
    Msp430(Msp430Cpu),
}

impl PlatformCpu {
    /// Wraps an interpreter in the driver for its architecture.
    pub fn new(core: Box<dyn CpuCore>) -> Self {
        let platform = core.platform();
        match platform.architecture() {
            Architecture::Avr => PlatformCpu::Avr(AvrCpu {
                budget: platform.cycles_per(MILLISECOND),
                core,
            }),
            Architecture::Msp430 => PlatformCpu::Msp430(Msp430Cpu {
                core,
                last_execute: 0,
                sleeping: false,
                next_wakeup_cycle: None,
            }),
        }
    }

    pub fn platform(&self) -> Platform {
        self.core().platform()
    }

    pub fn cycle_count(&self) -> u64 {
        self.core().cycle_count()
    }

    fn core(&self) -> &dyn CpuCore {
        match self {
            PlatformCpu::Avr(cpu) => cpu.core.as_ref(),
            PlatformCpu::Msp430(cpu) => cpu.core.as_ref(),
        }
    }

    /// Runs the CPU at mote clock time `clock` (>= 0).
    fn execute(&mut self, clock: i64, memory: &mut MoteMemory) -> Result<Execution, CpuFault> {
        match self {
            PlatformCpu::Avr(cpu) => {
                let report = cpu.core.run_cycles(cpu.budget, memory)?;
                Ok(Execution {
                    uart: report.uart,
                    sleeping: report.sleeping,
                    delay: MILLISECOND,
                })
            }
            PlatformCpu::Msp430(cpu) => {
                if clock < cpu.last_execute {
                    return Err(CpuFault::Interpreter(format!(
                        "bad event ordering: {} < {}",
                        clock, cpu.last_execute
                    )));
                }
                cpu.last_execute = clock;

                let platform = cpu.core.platform();
                let target = platform.cycles_per(clock as SimTime);
                let budget = target.saturating_sub(cpu.core.cycle_count());

                let mut uart = Vec::new();
                if budget > 0 {
                    let report = cpu.core.run_cycles(budget, memory)?;
                    uart = report.uart;
                    cpu.sleeping = report.sleeping;
                    cpu.next_wakeup_cycle = report.next_wakeup_cycle;
                }

                let delay = match cpu.next_wakeup_cycle {
                    Some(cycle) => {
                        let requested = platform.micros_for(cycle);
                        let now = clock as SimTime;
                        if requested < now {
                            return Err(CpuFault::EarlyWakeup { requested, now });
                        }
                        (requested - now).max(1)
                    }
                    None => MILLISECOND,
                };

                Ok(Execution {
                    uart,
                    sleeping: cpu.sleeping,
                    delay,
                })
            }
        }
    }
}

/// One emulated mote.
pub struct Mote {
    id: MoteId,
    mote_type: Arc<MoteType>,
    cpu: PlatformCpu,
    memory: MoteMemory,
    interfaces: MoteInterfaceHandler,
    drift: i64,
    state: MoteState,
    next_tick: Option<SimTime>,
    tick_event: Option<EventId>,
}

impl Mote {
    pub fn new(
        id: MoteId,
        mote_type: Arc<MoteType>,
        cpu: Box<dyn CpuCore>,
        memory: MoteMemory,
        interfaces: MoteInterfaceHandler,
    ) -> Self {
        Self {
            id,
            mote_type,
            cpu: PlatformCpu::new(cpu),
            memory,
            interfaces,
            drift: 0,
            state: MoteState::Active,
            next_tick: None,
            tick_event: None,
        }
    }

    pub fn id(&self) -> MoteId {
        self.id
    }

    pub fn mote_type(&self) -> &Arc<MoteType> {
        &self.mote_type
    }

    pub fn platform(&self) -> Platform {
        self.cpu.platform()
    }

    pub fn cpu(&self) -> &PlatformCpu {
        &self.cpu
    }

    pub fn memory(&self) -> &MoteMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MoteMemory {
        &mut self.memory
    }

    pub fn interfaces(&self) -> &MoteInterfaceHandler {
        &self.interfaces
    }

    pub fn interfaces_mut(&mut self) -> &mut MoteInterfaceHandler {
        &mut self.interfaces
    }

    pub fn state(&self) -> MoteState {
        self.state
    }

    /// Kills the mote. Dead motes are never ticked or polled again.
    pub fn kill(&mut self) {
        self.state = MoteState::Dead;
        self.next_tick = None;
    }

    /// Offset of the mote clock from simulation time.
    pub fn clock_drift(&self) -> i64 {
        self.drift
    }

    pub fn set_clock_drift(&mut self, drift: i64) {
        self.drift = drift;
    }

    /// Mote clock at simulation time `now`.
    pub fn clock_time(&self, now: SimTime) -> i64 {
        now as i64 + self.drift
    }

    /// Simulation time the mote last asked to be ticked at.
    pub fn next_tick(&self) -> Option<SimTime> {
        self.next_tick
    }

    pub(crate) fn tick_event(&self) -> Option<EventId> {
        self.tick_event
    }

    pub(crate) fn set_tick_event(&mut self, event: Option<EventId>) {
        self.tick_event = event;
    }

    /// Advances the mote to simulation time `now`.
    ///
    /// Returns `Ok(true)` if the mote wants another tick, at
    /// [`next_tick`](Self::next_tick). A fault leaves a retry tick one
    /// millisecond later so the mote can resume after a restart.
    pub fn tick(&mut self, now: SimTime) -> Result<bool, CpuFault> {
        if self.state == MoteState::Dead {
            self.next_tick = None;
            return Ok(false);
        }

        let clock = self.clock_time(now);
        if clock < 0 {
            // Not booted: sleep until the mote clock reaches zero
            self.next_tick = Some(now + clock.unsigned_abs());
            return Ok(true);
        }

        let Mote {
            id,
            cpu,
            memory,
            interfaces,
            drift,
            state,
            next_tick,
            ..
        } = self;

        let mut ctx = PollContext {
            mote: *id,
            time: now,
            clock_time: clock,
            drift: *drift,
            memory,
        };

        interfaces.do_passive_actions_before_tick(&mut ctx);
        if *state == MoteState::Active {
            interfaces.do_active_actions_before_tick(&mut ctx);
        }

        let execution = match cpu.execute(clock, ctx.memory) {
            Ok(execution) => execution,
            Err(fault) => {
                *next_tick = Some(now + MILLISECOND);
                return Err(fault);
            }
        };

        if !execution.uart.is_empty() {
            interfaces.serial_data(&execution.uart, &mut ctx);
        }
        *state = if execution.sleeping {
            MoteState::LowPower
        } else {
            MoteState::Active
        };
        *next_tick = Some(now + execution.delay);

        if *state == MoteState::Active {
            interfaces.do_active_actions_after_tick(&mut ctx);
        }
        interfaces.do_passive_actions_after_tick(&mut ctx);

        Ok(true)
    }
}

impl std::fmt::Debug for Mote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mote")
            .field("id", &self.id)
            .field("type", &self.mote_type.identifier)
            .field("state", &self.state)
            .field("drift", &self.drift)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motesim_env::{CpuReport, MemoryBus};

    /// Burns its budget, prints "tick" every run and can be told to sleep
    /// or to ask for a wakeup at a given absolute cycle.
    struct TestCpu {
        platform: Platform,
        cycles: u64,
        sleep: bool,
        wakeup_in: Option<u64>,
        fail: Option<CpuFault>,
    }

    impl TestCpu {
        fn boxed(platform: Platform) -> Box<dyn CpuCore> {
            Box::new(TestCpu {
                platform,
                cycles: 0,
                sleep: false,
                wakeup_in: None,
                fail: None,
            })
        }
    }

    impl CpuCore for TestCpu {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn run_cycles(&mut self, budget: u64, bus: &mut dyn MemoryBus) -> Result<CpuReport, CpuFault> {
            if let Some(fault) = self.fail.clone() {
                return Err(fault);
            }
            self.cycles += budget;
            bus.write_byte(0x1100, (self.cycles % 251) as u8)?;
            Ok(CpuReport {
                cycles: budget,
                uart: b"tick\n".to_vec(),
                sleeping: self.sleep,
                next_wakeup_cycle: self.wakeup_in.map(|delta| self.cycles + delta),
            })
        }

        fn cycle_count(&self) -> u64 {
            self.cycles
        }
    }

    fn mote(platform: Platform, cpu: Box<dyn CpuCore>) -> Mote {
        let mote_type = Arc::new(MoteType::new("t", platform));
        let memory = MoteMemory::default().with_ram(0x1100, 16);
        let mut interfaces = MoteInterfaceHandler::new(true);
        interfaces.add(Box::new(MoteClock::new()));
        interfaces.add(Box::new(LogOutput::new()));
        Mote::new(MoteId(1), mote_type, cpu, memory, interfaces)
    }

    #[test]
    fn test_waits_for_boot() {
        let mut m = mote(Platform::MicaZ, TestCpu::boxed(Platform::MicaZ));
        m.set_clock_drift(-700);

        assert!(m.tick(0).unwrap());
        assert_eq!(m.next_tick(), Some(700));
        assert_eq!(m.cpu().cycle_count(), 0);

        assert!(m.tick(700).unwrap());
        assert_eq!(m.next_tick(), Some(700 + MILLISECOND));
        assert_eq!(m.cpu().cycle_count(), Platform::MicaZ.cycles_per(MILLISECOND));
        assert_eq!(m.interfaces().get::<LogOutput>().unwrap().line_count(), 1);
        assert_eq!(m.interfaces().get::<MoteClock>().unwrap().time(), 0);
    }

    #[test]
    fn test_sky_catches_up_to_clock() {
        let mut m = mote(Platform::Sky, TestCpu::boxed(Platform::Sky));

        // Boot instant: nothing to run yet
        assert!(m.tick(0).unwrap());
        assert_eq!(m.cpu().cycle_count(), 0);
        assert_eq!(m.next_tick(), Some(MILLISECOND));

        assert!(m.tick(2 * MILLISECOND).unwrap());
        assert_eq!(m.cpu().cycle_count(), Platform::Sky.cycles_per(2 * MILLISECOND));
    }

    #[test]
    fn test_sky_honours_wakeup() {
        let cpu = Box::new(TestCpu {
            platform: Platform::Sky,
            cycles: 0,
            sleep: true,
            wakeup_in: Some(39_000),
            fail: None,
        });
        let mut m = mote(Platform::Sky, cpu);

        m.tick(0).unwrap();
        m.tick(MILLISECOND).unwrap();
        assert_eq!(m.state(), MoteState::LowPower);
        // 3900 + 39000 cycles at 3.9 MHz is 11 ms of mote time
        assert_eq!(m.next_tick(), Some(11 * MILLISECOND));
    }

    #[test]
    fn test_sky_bad_event_ordering() {
        let mut m = mote(Platform::Sky, TestCpu::boxed(Platform::Sky));
        m.tick(5 * MILLISECOND).unwrap();
        let err = m.tick(MILLISECOND).unwrap_err();
        assert!(matches!(err, CpuFault::Interpreter(ref msg) if msg.contains("bad event ordering")));
    }

    #[test]
    fn test_fault_leaves_retry_tick() {
        let cpu = Box::new(TestCpu {
            platform: Platform::MicaZ,
            cycles: 0,
            sleep: false,
            wakeup_in: None,
            fail: Some(CpuFault::stop("breakpoint")),
        });
        let mut m = mote(Platform::MicaZ, cpu);
        assert!(m.tick(3).unwrap_err().is_stop_request());
        assert_eq!(m.next_tick(), Some(3 + MILLISECOND));
    }

    #[test]
    fn test_dead_mote_is_not_ticked() {
        let mut m = mote(Platform::MicaZ, TestCpu::boxed(Platform::MicaZ));
        m.kill();
        assert!(!m.tick(0).unwrap());
        assert_eq!(m.next_tick(), None);
        assert_eq!(m.cpu().cycle_count(), 0);
    }

    #[test]
    fn test_create_mote_from_registry() {
        let mut registry = Registry::new();
        registry.register_cpu(Platform::Sky, |_| TestCpu::boxed(Platform::Sky));

        let sky = Arc::new(MoteType::new("sky1", Platform::Sky).with_variable("counter", 0x1100));
        let mote = sky.create_mote(&registry, MoteId(9)).unwrap();
        assert_eq!(mote.id(), MoteId(9));
        assert_eq!(mote.platform(), Platform::Sky);
        assert_eq!(mote.memory().int_value_of("counter").unwrap(), 0);

        let micaz = Arc::new(MoteType::new("micaz1", Platform::MicaZ));
        assert!(matches!(
            micaz.create_mote(&registry, MoteId(10)),
            Err(ConfigError::UnknownPlatform(_))
        ));
    }
}
