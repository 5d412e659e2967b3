//! Explicit factory registry for CPU interpreters and radio media.
//!
//! One registry is built at startup and passed by reference to whoever
//! creates motes or media. There is no global state.

use crate::error::ConfigError;
use motesim_env::{CpuCore, MoteId, Platform, RadioMedium};
use std::collections::{BTreeMap, HashMap};

/// Builds the interpreter for a new mote.
pub type CpuFactory = Box<dyn Fn(MoteId) -> Box<dyn CpuCore> + Send + Sync>;

/// Builds a radio medium.
pub type RadioFactory = Box<dyn Fn() -> Box<dyn RadioMedium> + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    cpus: HashMap<Platform, CpuFactory>,
    radios: BTreeMap<String, RadioFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the interpreter for a platform.
    pub fn register_cpu<F>(&mut self, platform: Platform, factory: F)
    where
        F: Fn(MoteId) -> Box<dyn CpuCore> + Send + Sync + 'static,
    {
        self.cpus.insert(platform, Box::new(factory));
    }

    /// Registers (or replaces) a radio medium under `name`.
    pub fn register_radio_medium<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn RadioMedium> + Send + Sync + 'static,
    {
        self.radios.insert(name.into(), Box::new(factory));
    }

    pub fn create_cpu(&self, platform: Platform, mote: MoteId) -> Result<Box<dyn CpuCore>, ConfigError> {
        let factory = self
            .cpus
            .get(&platform)
            .ok_or_else(|| ConfigError::UnknownPlatform(platform.to_string()))?;
        Ok(factory(mote))
    }

    pub fn create_radio_medium(&self, name: &str) -> Result<Box<dyn RadioMedium>, ConfigError> {
        let factory = self
            .radios
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRadioMedium(name.to_string()))?;
        Ok(factory())
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.cpus.contains_key(&platform)
    }

    /// Registered radio medium names, sorted.
    pub fn radio_media(&self) -> Vec<&str> {
        self.radios.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut platforms: Vec<_> = self.cpus.keys().map(|p| p.name()).collect();
        platforms.sort_unstable();
        f.debug_struct("Registry")
            .field("platforms", &platforms)
            .field("radio_media", &self.radio_media())
            .finish()
    }
}
