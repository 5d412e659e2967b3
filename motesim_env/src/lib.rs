//! motesim Environment Abstraction Layer
//!
//! This crate holds the contracts between the simulation kernel and the
//! collaborators it drives but does not own:
//! - **CPU interpreters** (`CpuCore`): execute firmware cycles for one mote
//! - **Radio media** (`RadioMedium`): observe registered motes and deliver frames
//!
//! It also fixes the shared vocabulary every timed component relies on:
//! simulated time is an integer count of microseconds.
//!
//! # Example
//!
//! ```ignore
//! use motesim_env::{CpuCore, MemoryBus, MILLISECOND};
//!
//! fn run_one_millisecond(cpu: &mut dyn CpuCore, bus: &mut dyn MemoryBus) {
//!     let budget = cpu.platform().cycles_per(MILLISECOND);
//!     let report = cpu.run_cycles(budget, bus).expect("cpu fault");
//!     println!("executed {} cycles", report.cycles);
//! }
//! ```

mod cpu;
mod error;
mod radio;
mod types;

pub use cpu::{CpuCore, CpuReport, MemoryBus};
pub use error::{CpuFault, EnvError};
pub use radio::RadioMedium;
pub use types::{Architecture, MoteId, Platform, SimTime, MICROSECOND, MILLISECOND, SECOND};
