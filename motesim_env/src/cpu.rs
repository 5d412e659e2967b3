//! CPU interpreter abstraction for emulated motes.

use crate::error::CpuFault;
use crate::types::Platform;

/// Memory as seen by a CPU interpreter.
///
/// The kernel owns each mote's memory and lends it to the interpreter for
/// the duration of one `run_cycles` call.
pub trait MemoryBus {
    /// Reads one byte.
    fn read_byte(&self, address: u32) -> Result<u8, CpuFault>;

    /// Writes one byte.
    fn write_byte(&mut self, address: u32, value: u8) -> Result<(), CpuFault>;

    /// Writes a contiguous run of bytes.
    fn write_bytes(&mut self, address: u32, data: &[u8]) -> Result<(), CpuFault> {
        for (offset, byte) in data.iter().enumerate() {
            self.write_byte(address + offset as u32, *byte)?;
        }
        Ok(())
    }
}

/// Outcome of one interpreter run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuReport {
    /// Cycles actually executed (may overshoot the budget by one instruction)
    pub cycles: u64,

    /// Bytes the firmware wrote to its serial port during the run
    pub uart: Vec<u8>,

    /// True if the CPU ended the run in a low-power mode
    pub sleeping: bool,

    /// Absolute cycle count (since reset) at which the CPU next needs
    /// service. `None` means "no timer armed".
    pub next_wakeup_cycle: Option<u64>,
}

/// The interface between the kernel and an instruction-set interpreter.
///
/// Bit-accurate instruction semantics live entirely behind this trait; the
/// kernel only decides *when* to run and *how many* cycles.
///
/// # Implementations
///
/// - **AVR** (MicaZ): the kernel runs a fixed budget every millisecond
/// - **MSP430** (Sky): the kernel runs the elapsed budget and honours the
///   reported wakeup
pub trait CpuCore: Send {
    /// Platform this interpreter emulates.
    fn platform(&self) -> Platform;

    /// Executes at least `budget` cycles (or until the CPU sleeps).
    ///
    /// # Returns
    /// * `Ok(report)` - what happened during the run
    /// * `Err(CpuFault::StopRequested)` - a breakpoint fired
    /// * `Err(_)` - the firmware crashed the interpreter
    fn run_cycles(&mut self, budget: u64, bus: &mut dyn MemoryBus) -> Result<CpuReport, CpuFault>;

    /// Total cycles executed since reset.
    fn cycle_count(&self) -> u64;
}
