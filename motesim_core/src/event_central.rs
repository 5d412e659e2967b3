//! Simulation-wide observer hub.
//!
//! [`SimEventCentral`] fans mote add/remove notifications out to listeners
//! and keeps a bounded, oldest-first history of mote log output.
//!
//! Log observation is reference-counted: the first log listener installs a
//! hook on every log output interface of every mote, and the last one to
//! leave tears the hooks down and clears the history. Hooks deliver records
//! through a channel which the kernel flushes after every event.
//!
//! When the history is full, each eviction is announced to listeners
//! before the record that caused it.

use crate::config::{validate_buffer_size, DEFAULT_LOG_OUTPUT_BUFFER_SIZE};
use crate::error::ConfigError;
use crate::interfaces::{HookId, LogOutputEvent};
use crate::mote::Mote;
use crossbeam::channel::{unbounded, Receiver, Sender};
use motesim_env::MoteId;
use std::collections::VecDeque;
use tracing::debug;

/// Handle returned when a listener is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observes motes entering and leaving the simulation.
pub trait MoteCountListener: Send {
    fn mote_added(&mut self, mote: MoteId);
    fn mote_removed(&mut self, mote: MoteId);
}

/// Observes the log output history.
pub trait LogOutputListener: Send {
    /// A record was appended.
    fn new_log_output(&mut self, event: &LogOutputEvent);
    /// A record was evicted.
    fn removed_log_output(&mut self, event: &LogOutputEvent);
}

pub struct SimEventCentral {
    next_id: u64,
    count_listeners: Vec<(ListenerId, Box<dyn MoteCountListener>)>,
    log_listeners: Vec<(ListenerId, Box<dyn LogOutputListener>)>,

    history: VecDeque<LogOutputEvent>,
    capacity: usize,

    /// Installed hooks, by owning mote
    hooks: Vec<(MoteId, HookId)>,
    sender: Sender<LogOutputEvent>,
    receiver: Receiver<LogOutputEvent>,
}

impl SimEventCentral {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        validate_buffer_size(capacity)?;
        let (sender, receiver) = unbounded();
        Ok(Self {
            next_id: 1,
            count_listeners: Vec::new(),
            log_listeners: Vec::new(),
            history: VecDeque::new(),
            capacity,
            hooks: Vec::new(),
            sender,
            receiver,
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // Mote count
    // ------------------------------------------------------------------

    pub fn add_mote_count_listener(&mut self, listener: Box<dyn MoteCountListener>) -> ListenerId {
        let id = ListenerId(self.next_id());
        self.count_listeners.push((id, listener));
        id
    }

    pub fn remove_mote_count_listener(&mut self, id: ListenerId) -> bool {
        let before = self.count_listeners.len();
        self.count_listeners.retain(|(listener, _)| *listener != id);
        self.count_listeners.len() != before
    }

    /// Called by the kernel once `mote` has joined the simulation.
    pub fn mote_added(&mut self, mote: &mut Mote) {
        if !self.log_listeners.is_empty() {
            self.install_hooks(mote);
        }
        for (_, listener) in self.count_listeners.iter_mut() {
            listener.mote_added(mote.id());
        }
    }

    /// Called by the kernel once `mote` has left the simulation. Records
    /// the mote produced but that were not flushed yet are dropped.
    pub fn mote_removed(&mut self, mote: &mut Mote) {
        let id = mote.id();
        let pending: Vec<LogOutputEvent> = self.receiver.try_iter().collect();
        for event in pending {
            if event.mote != id {
                self.push_log_output(event);
            }
        }

        self.uninstall_hooks(mote);
        for (_, listener) in self.count_listeners.iter_mut() {
            listener.mote_removed(id);
        }
    }

    // ------------------------------------------------------------------
    // Log output
    // ------------------------------------------------------------------

    /// Attaches a log listener. The first one installs hooks on `motes`.
    pub fn add_log_output_listener(&mut self, listener: Box<dyn LogOutputListener>, motes: &mut [Mote]) -> ListenerId {
        if self.log_listeners.is_empty() {
            for mote in motes.iter_mut() {
                self.install_hooks(mote);
            }
            debug!("Log observation started ({} hooks)", self.hooks.len());
        }

        let id = ListenerId(self.next_id());
        self.log_listeners.push((id, listener));
        id
    }

    /// Detaches a log listener. The last one removes every hook and clears
    /// the history.
    pub fn remove_log_output_listener(&mut self, id: ListenerId, motes: &mut [Mote]) -> bool {
        let before = self.log_listeners.len();
        self.log_listeners.retain(|(listener, _)| *listener != id);
        if self.log_listeners.len() == before {
            return false;
        }

        if self.log_listeners.is_empty() {
            for mote in motes.iter_mut() {
                self.uninstall_hooks(mote);
            }
            self.hooks.clear();
            self.receiver.try_iter().for_each(drop);
            self.history.clear();
            debug!("Log observation stopped");
        }
        true
    }

    pub fn log_listener_count(&self) -> usize {
        self.log_listeners.len()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Moves records delivered by hooks into the history.
    pub fn flush_pending(&mut self) {
        while let Ok(event) = self.receiver.try_recv() {
            self.push_log_output(event);
        }
    }

    /// Appends a record, evicting the oldest ones first if the history is full.
    pub fn push_log_output(&mut self, event: LogOutputEvent) {
        while self.history.len() >= self.capacity {
            self.evict_oldest();
        }
        for (_, listener) in self.log_listeners.iter_mut() {
            listener.new_log_output(&event);
        }
        self.history.push_back(event);
    }

    fn evict_oldest(&mut self) {
        if let Some(removed) = self.history.pop_front() {
            for (_, listener) in self.log_listeners.iter_mut() {
                listener.removed_log_output(&removed);
            }
        }
    }

    /// Snapshot of the history, oldest first.
    pub fn log_output_history(&self) -> Vec<LogOutputEvent> {
        self.history.iter().cloned().collect()
    }

    pub fn log_output_buffer_size(&self) -> usize {
        self.capacity
    }

    /// Changes the history capacity, evicting down to it immediately.
    pub fn set_log_output_buffer_size(&mut self, size: usize) -> Result<(), ConfigError> {
        validate_buffer_size(size)?;
        self.capacity = size;
        while self.history.len() > self.capacity {
            self.evict_oldest();
        }
        Ok(())
    }

    fn install_hooks(&mut self, mote: &mut Mote) {
        let id = mote.id();
        for log in mote.interfaces_mut().log_outputs_mut() {
            let hook = HookId(self.next_id);
            self.next_id += 1;
            log.install_hook(hook, self.sender.clone());
            self.hooks.push((id, hook));
        }
    }

    fn uninstall_hooks(&mut self, mote: &mut Mote) {
        let id = mote.id();
        let owned: Vec<HookId> = self
            .hooks
            .iter()
            .filter(|(owner, _)| *owner == id)
            .map(|(_, hook)| *hook)
            .collect();
        for log in mote.interfaces_mut().log_outputs_mut() {
            for hook in &owned {
                log.remove_hook(*hook);
            }
        }
        self.hooks.retain(|(owner, _)| *owner != id);
    }
}

impl Default for SimEventCentral {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            next_id: 1,
            count_listeners: Vec::new(),
            log_listeners: Vec::new(),
            history: VecDeque::new(),
            capacity: DEFAULT_LOG_OUTPUT_BUFFER_SIZE,
            hooks: Vec::new(),
            sender,
            receiver,
        }
    }
}

impl std::fmt::Debug for SimEventCentral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEventCentral")
            .field("count_listeners", &self.count_listeners.len())
            .field("log_listeners", &self.log_listeners.len())
            .field("history", &self.history.len())
            .field("capacity", &self.capacity)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
