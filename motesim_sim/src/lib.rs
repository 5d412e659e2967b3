//! motesim headless harness
//!
//! Runs the kernel without a GUI: every mote gets a deterministic
//! stand-in interpreter, the radio medium only tracks registrations, and
//! each named scenario checks one kernel behaviour end to end.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                       │
//! │   Script ──► Registry ──► MoteType::create_mote          │
//! │                               │                          │
//! │  ┌────────────────────────────▼───────────────────────┐  │
//! │  │ Simulation (kernel on the simulation thread)       │  │
//! │  │   ScriptedCpu  ScriptedCpu  ...   Silent/Broadcast │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │       │ listeners, ms observer, Stopped notifications    │
//! │  ┌────▼─────┐                                            │
//! │  │  Probe   │ ──► ScenarioResult / ScenarioMetrics       │
//! │  └──────────┘                                            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use motesim_sim::{ScenarioId, ScenarioRunner};
//!
//! let runner = ScenarioRunner::new(42, 8).with_duration_ms(5_000);
//! let result = runner.run(ScenarioId::BootStorm);
//! assert!(result.passed);
//! ```

pub mod cpu;
pub mod radio;
mod runner;
pub mod scenarios;

pub use cpu::{Script, ScriptedCpu};
pub use radio::{BroadcastMedium, Registrations, SilentMedium};
pub use runner::{
    registry, RunError, ScenarioMetrics, ScenarioResult, ScenarioRunner, SharedFaultHandler, DEFAULT_SPEED_LIMIT,
};
pub use scenarios::ScenarioId;
