//! motesim Core - Discrete-Event Simulation Kernel for Sensor-Network Motes
//!
//! This crate drives emulated motes (AVR and MSP430 CPU interpreters) in
//! simulated time. Its heart is a single-threaded cooperative scheduler:
//!
//! 1. **EventQueue**: time-ordered chain of events, FIFO for equal times
//! 2. **Kernel**: pops the next event, advances the clock, executes it
//! 3. **Simulation**: runs the kernel on its own thread and marshals every
//!    outside request onto that thread as a poll request
//!
//! Motes are ticked by per-mote events and poll their interfaces around
//! every tick; [`SimEventCentral`] multiplexes mote and log-output
//! notifications with a bounded history.
//!
//! # Usage
//!
//! ```ignore
//! use motesim_core::{MoteType, Registry, SimConfig, Simulation};
//! use motesim_env::{MoteId, Platform, SECOND};
//! use std::sync::Arc;
//!
//! let registry: Registry = build_registry();
//! let sky = Arc::new(MoteType::new("sky1", Platform::Sky));
//!
//! let sim = Simulation::new(SimConfig::default().with_seed(42), registry.create_radio_medium("silent")?)?;
//! for i in 1..=3 {
//!     sim.add_mote(sky.create_mote(&registry, MoteId(i))?)?;
//! }
//! sim.query(|kernel| kernel.schedule_stop(10 * SECOND))??;
//! sim.start()?;
//! ```

pub mod config;
pub mod error;
pub mod event_central;
pub mod event_queue;
pub mod interfaces;
pub mod memory;
pub mod mote;
pub mod registry;
pub mod simulation;

pub use config::{FaultPolicy, SimConfig, DEFAULT_LOG_OUTPUT_BUFFER_SIZE};
pub use error::{ConfigError, MemoryError, SchedulingError, SimError, SimResult};
pub use event_central::{ListenerId, LogOutputListener, MoteCountListener, SimEventCentral};
pub use event_queue::{EventId, EventQueue};
pub use interfaces::{
    InterfaceKind, LedBank, LogOutput, LogOutputEvent, MoteClock, MoteInterface, MoteInterfaceHandler, PollContext,
    PollPhase,
};
pub use memory::MoteMemory;
pub use mote::{InterfaceSpec, Mote, MoteState, MoteType, PlatformCpu};
pub use registry::{CpuFactory, RadioFactory, Registry};
pub use simulation::{
    FaultHandler, FnEvent, Kernel, MillisecondObserver, ObserverId, Simulation, SimulationEvent, TimeEvent,
};
