//! Mote interfaces and their per-tick dispatch.
//!
//! Every mote owns a [`MoteInterfaceHandler`] holding two ordered lists:
//!
//! - **active** interfaces, polled around a tick only while the mote is
//!   awake
//! - **passive** interfaces, polled around every tick unless the mote is
//!   dead
//!
//! Both lists are walked in registration order.

use crate::memory::MoteMemory;
use crossbeam::channel::Sender;
use motesim_env::{MoteId, SimTime};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Which list an interface lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Active,
    Passive,
}

/// When an interface is being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    BeforeTick,
    AfterTick,
}

/// What an interface sees of its mote while being polled.
pub struct PollContext<'a> {
    pub mote: MoteId,
    /// Simulation time
    pub time: SimTime,
    /// Mote-local clock (simulation time plus drift)
    pub clock_time: i64,
    pub drift: i64,
    pub memory: &'a mut MoteMemory,
}

/// A peripheral attached to a mote.
pub trait MoteInterface: Send + Any {
    fn name(&self) -> &str;

    fn kind(&self) -> InterfaceKind;

    /// Whether the interface wants to be polled in `phase`.
    fn polls(&self, phase: PollPhase) -> bool {
        let _ = phase;
        true
    }

    /// Uniform poll callback.
    fn poll(&mut self, phase: PollPhase, ctx: &mut PollContext<'_>);

    /// Bytes the CPU wrote to its serial port.
    fn serial_data(&mut self, data: &[u8], ctx: &mut PollContext<'_>) {
        let _ = (data, ctx);
    }

    /// The owning mote was added to a simulation.
    fn added(&mut self, mote: MoteId) {
        let _ = mote;
    }

    /// The owning mote was removed from its simulation.
    fn removed(&mut self, mote: MoteId) {
        let _ = mote;
    }

    /// Log output interfaces are the ones SimEventCentral observes.
    fn log_output_mut(&mut self) -> Option<&mut LogOutput> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Per-mote interface registry.
pub struct MoteInterfaceHandler {
    active: Vec<Box<dyn MoteInterface>>,
    passive: Vec<Box<dyn MoteInterface>>,

    /// Indices of active interfaces polled before a tick. Rebuilt lazily
    /// after the active set changes.
    active_before: Option<Vec<usize>>,
    cache_enabled: bool,
}

impl MoteInterfaceHandler {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            active: Vec::new(),
            passive: Vec::new(),
            active_before: None,
            cache_enabled,
        }
    }

    /// Turns the active-interface snapshot on or off.
    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.cache_enabled = enabled;
        self.active_before = None;
    }

    /// Registers an interface at the end of its list.
    pub fn add(&mut self, interface: Box<dyn MoteInterface>) {
        match interface.kind() {
            InterfaceKind::Active => {
                self.active.push(interface);
                self.active_before = None;
            }
            InterfaceKind::Passive => self.passive.push(interface),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn passive_count(&self) -> usize {
        self.passive.len()
    }

    /// Interface names, active first, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.all().map(|i| i.name().to_string()).collect()
    }

    /// First interface of type `T`.
    pub fn get<T: MoteInterface>(&self) -> Option<&T> {
        self.all().find_map(|i| i.as_any().downcast_ref::<T>())
    }

    /// First interface of type `T`, mutably.
    pub fn get_mut<T: MoteInterface>(&mut self) -> Option<&mut T> {
        self.active
            .iter_mut()
            .chain(self.passive.iter_mut())
            .find_map(|i| i.as_any_mut().downcast_mut::<T>())
    }

    /// Every log output interface of the mote.
    pub fn log_outputs_mut(&mut self) -> impl Iterator<Item = &mut LogOutput> {
        self.active
            .iter_mut()
            .chain(self.passive.iter_mut())
            .filter_map(|i| i.log_output_mut())
    }

    fn all(&self) -> impl Iterator<Item = &Box<dyn MoteInterface>> {
        self.active.iter().chain(self.passive.iter())
    }

    pub fn do_active_actions_before_tick(&mut self, ctx: &mut PollContext<'_>) {
        if !self.cache_enabled {
            for interface in self.active.iter_mut() {
                if interface.polls(PollPhase::BeforeTick) {
                    interface.poll(PollPhase::BeforeTick, ctx);
                }
            }
            return;
        }

        let Self {
            active, active_before, ..
        } = self;
        let snapshot = active_before.get_or_insert_with(|| {
            active
                .iter()
                .enumerate()
                .filter(|(_, i)| i.polls(PollPhase::BeforeTick))
                .map(|(index, _)| index)
                .collect()
        });
        for &index in snapshot.iter() {
            active[index].poll(PollPhase::BeforeTick, ctx);
        }
    }

    pub fn do_active_actions_after_tick(&mut self, ctx: &mut PollContext<'_>) {
        poll_all(&mut self.active, PollPhase::AfterTick, ctx);
    }

    pub fn do_passive_actions_before_tick(&mut self, ctx: &mut PollContext<'_>) {
        poll_all(&mut self.passive, PollPhase::BeforeTick, ctx);
    }

    pub fn do_passive_actions_after_tick(&mut self, ctx: &mut PollContext<'_>) {
        poll_all(&mut self.passive, PollPhase::AfterTick, ctx);
    }

    /// Hands serial output to every interface.
    pub fn serial_data(&mut self, data: &[u8], ctx: &mut PollContext<'_>) {
        for interface in self.active.iter_mut().chain(self.passive.iter_mut()) {
            interface.serial_data(data, ctx);
        }
    }

    pub fn added(&mut self, mote: MoteId) {
        for interface in self.active.iter_mut().chain(self.passive.iter_mut()) {
            interface.added(mote);
        }
    }

    pub fn removed(&mut self, mote: MoteId) {
        for interface in self.active.iter_mut().chain(self.passive.iter_mut()) {
            interface.removed(mote);
        }
    }
}

fn poll_all(list: &mut [Box<dyn MoteInterface>], phase: PollPhase, ctx: &mut PollContext<'_>) {
    for interface in list.iter_mut() {
        if interface.polls(phase) {
            interface.poll(phase, ctx);
        }
    }
}

impl std::fmt::Debug for MoteInterfaceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoteInterfaceHandler")
            .field("interfaces", &self.names())
            .field("cache_enabled", &self.cache_enabled)
            .finish()
    }
}

// ============================================================================
// BUILT-IN INTERFACES
// ============================================================================

/// Mote-local clock (passive).
#[derive(Debug, Default)]
pub struct MoteClock {
    time: i64,
    drift: i64,
}

impl MoteClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mote time at the last poll. Negative before boot.
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn drift(&self) -> i64 {
        self.drift
    }
}

impl MoteInterface for MoteClock {
    fn name(&self) -> &str {
        "clock"
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Passive
    }

    fn poll(&mut self, _phase: PollPhase, ctx: &mut PollContext<'_>) {
        self.time = ctx.clock_time;
        self.drift = ctx.drift;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One line of mote log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOutputEvent {
    pub mote: MoteId,
    pub time: SimTime,
    pub message: String,
}

/// Identifies an installed log hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub(crate) u64);

struct LogHook {
    id: HookId,
    sender: Sender<LogOutputEvent>,
}

/// Serial log output (active). Assembles UART bytes into lines.
pub struct LogOutput {
    partial: Vec<u8>,
    last_message: Option<String>,
    lines: u64,
    hooks: Vec<LogHook>,
}

impl LogOutput {
    pub fn new() -> Self {
        Self {
            partial: Vec::new(),
            last_message: None,
            lines: 0,
            hooks: Vec::new(),
        }
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    /// Completed lines so far.
    pub fn line_count(&self) -> u64 {
        self.lines
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub(crate) fn install_hook(&mut self, id: HookId, sender: Sender<LogOutputEvent>) {
        self.hooks.push(LogHook { id, sender });
    }

    pub(crate) fn remove_hook(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|hook| hook.id != id);
        self.hooks.len() != before
    }

    fn finish_line(&mut self, mote: MoteId, time: SimTime) {
        let bytes = std::mem::take(&mut self.partial);
        let mut message = String::from_utf8_lossy(&bytes).into_owned();
        if message.ends_with('\r') {
            message.pop();
        }

        self.lines += 1;
        for hook in &self.hooks {
            // A closed receiver just means nobody is listening any more
            let _ = hook.sender.send(LogOutputEvent {
                mote,
                time,
                message: message.clone(),
            });
        }
        self.last_message = Some(message);
    }
}

impl Default for LogOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl MoteInterface for LogOutput {
    fn name(&self) -> &str {
        "log"
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Active
    }

    fn polls(&self, _phase: PollPhase) -> bool {
        false
    }

    fn poll(&mut self, _phase: PollPhase, _ctx: &mut PollContext<'_>) {}

    fn serial_data(&mut self, data: &[u8], ctx: &mut PollContext<'_>) {
        for &byte in data {
            if byte == b'\n' {
                self.finish_line(ctx.mote, ctx.time);
            } else {
                self.partial.push(byte);
            }
        }
    }

    fn removed(&mut self, _mote: MoteId) {
        self.partial.clear();
    }

    fn log_output_mut(&mut self) -> Option<&mut LogOutput> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Memory-mapped LED byte (active). Bit `n` is LED `n`.
#[derive(Debug)]
pub struct LedBank {
    address: u32,
    state: u8,
    changes: u64,
}

impl LedBank {
    pub fn new(address: u32) -> Self {
        Self {
            address,
            state: 0,
            changes: 0,
        }
    }

    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn is_on(&self, led: u8) -> bool {
        led < 8 && self.state & (1 << led) != 0
    }

    /// Number of observed state changes.
    pub fn changes(&self) -> u64 {
        self.changes
    }
}

impl MoteInterface for LedBank {
    fn name(&self) -> &str {
        "leds"
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Active
    }

    fn polls(&self, phase: PollPhase) -> bool {
        phase == PollPhase::AfterTick
    }

    fn poll(&mut self, _phase: PollPhase, ctx: &mut PollContext<'_>) {
        let Ok(bytes) = ctx.memory.memory_segment(self.address, 1) else {
            return;
        };
        if bytes[0] != self.state {
            self.state = bytes[0];
            self.changes += 1;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
