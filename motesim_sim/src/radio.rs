//! Stand-in radio media.
//!
//! Both media satisfy the registration contract and nothing more; no frame
//! is ever transmitted.

use motesim_env::{EnvError, MoteId, RadioMedium};
use std::sync::{Arc, Mutex};

/// Names the harness registers its media under.
pub const SILENT: &str = "silent";
pub const BROADCAST: &str = "broadcast";

/// Registration list shared with the harness, which keeps reading it after
/// the medium has been handed to the kernel.
#[derive(Debug, Clone, Default)]
pub struct Registrations(Arc<Mutex<Vec<MoteId>>>);

impl Registrations {
    pub fn snapshot(&self) -> Vec<MoteId> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<MoteId>> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn add(&self, mote: MoteId) -> Result<(), EnvError> {
        let mut motes = self.guard();
        if motes.contains(&mote) {
            return Err(EnvError::radio(format!("{} registered twice", mote)));
        }
        motes.push(mote);
        Ok(())
    }

    fn remove(&self, mote: MoteId) -> Result<(), EnvError> {
        let mut motes = self.guard();
        let index = motes
            .iter()
            .position(|m| *m == mote)
            .ok_or(EnvError::UnknownMote(mote))?;
        motes.remove(index);
        Ok(())
    }
}

/// Medium where nobody hears anybody.
#[derive(Debug, Clone, Default)]
pub struct SilentMedium {
    registrations: Registrations,
}

impl SilentMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> Registrations {
        self.registrations.clone()
    }
}

impl RadioMedium for SilentMedium {
    fn name(&self) -> &str {
        SILENT
    }

    fn register_mote(&mut self, mote: MoteId) -> Result<(), EnvError> {
        self.registrations.add(mote)
    }

    fn unregister_mote(&mut self, mote: MoteId) -> Result<(), EnvError> {
        self.registrations.remove(mote)
    }

    fn registered_motes(&self) -> Vec<MoteId> {
        self.registrations.snapshot()
    }
}

/// Medium with motes placed on a line by id; two motes hear each other
/// when their ids differ by at most `range`.
#[derive(Debug, Clone, Default)]
pub struct BroadcastMedium {
    range: u32,
    registrations: Registrations,
}

impl BroadcastMedium {
    pub fn new(range: u32) -> Self {
        Self {
            range,
            registrations: Registrations::default(),
        }
    }

    pub fn registrations(&self) -> Registrations {
        self.registrations.clone()
    }

    /// Registered motes within range of `mote` (excluding itself).
    pub fn neighbours(&self, mote: MoteId) -> Vec<MoteId> {
        self.registrations
            .snapshot()
            .into_iter()
            .filter(|other| *other != mote && other.0.abs_diff(mote.0) <= self.range)
            .collect()
    }

    /// Unordered pairs of registered motes that can hear each other.
    pub fn audible_pairs(&self) -> usize {
        let motes = self.registrations.snapshot();
        motes
            .iter()
            .enumerate()
            .map(|(i, a)| motes[i + 1..].iter().filter(|b| a.0.abs_diff(b.0) <= self.range).count())
            .sum()
    }
}

impl RadioMedium for BroadcastMedium {
    fn name(&self) -> &str {
        BROADCAST
    }

    fn register_mote(&mut self, mote: MoteId) -> Result<(), EnvError> {
        self.registrations.add(mote)
    }

    fn unregister_mote(&mut self, mote: MoteId) -> Result<(), EnvError> {
        self.registrations.remove(mote)
    }

    fn registered_motes(&self) -> Vec<MoteId> {
        self.registrations.snapshot()
    }
}
