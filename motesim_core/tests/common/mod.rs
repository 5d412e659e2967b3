//! Test collaborators shared by the kernel integration tests.

#![allow(dead_code)]

use motesim_core::{Mote, MoteType, Registry, SimConfig, Simulation};
use motesim_env::{CpuCore, CpuFault, CpuReport, EnvError, MemoryBus, MoteId, Platform, RadioMedium};
use std::sync::{Arc, Mutex};

/// Minimal interpreter: burns its budget, prints a line every `line_every`
/// runs and can be told to fail on a given run.
pub struct TestCpu {
    pub platform: Platform,
    pub cycles: u64,
    pub runs: u64,
    pub line_every: u64,
    pub fail_on_run: Option<(u64, CpuFault)>,
}

impl TestCpu {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            cycles: 0,
            runs: 0,
            line_every: 1,
            fail_on_run: None,
        }
    }
}

impl CpuCore for TestCpu {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn run_cycles(&mut self, budget: u64, bus: &mut dyn MemoryBus) -> Result<CpuReport, CpuFault> {
        self.runs += 1;
        if let Some((run, fault)) = &self.fail_on_run {
            if *run == self.runs {
                return Err(fault.clone());
            }
        }

        self.cycles += budget;
        bus.write_bytes(0x1100, &(self.runs as u32).to_le_bytes())?;

        let uart = if self.line_every > 0 && self.runs % self.line_every == 0 {
            format!("run {}\n", self.runs).into_bytes()
        } else {
            Vec::new()
        };
        Ok(CpuReport {
            cycles: budget,
            uart,
            sleeping: false,
            next_wakeup_cycle: None,
        })
    }

    fn cycle_count(&self) -> u64 {
        self.cycles
    }
}

/// Radio medium that only records registrations and refuses duplicates.
#[derive(Clone, Default)]
pub struct TestMedium {
    pub name: String,
    pub registered: Arc<Mutex<Vec<MoteId>>>,
}

impl TestMedium {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registered: Arc::default(),
        }
    }

    pub fn registered(&self) -> Vec<MoteId> {
        self.registered.lock().unwrap().clone()
    }
}

impl RadioMedium for TestMedium {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_mote(&mut self, mote: MoteId) -> Result<(), EnvError> {
        let mut registered = self.registered.lock().unwrap();
        if registered.contains(&mote) {
            return Err(EnvError::radio(format!("{} registered twice", mote)));
        }
        registered.push(mote);
        Ok(())
    }

    fn unregister_mote(&mut self, mote: MoteId) -> Result<(), EnvError> {
        let mut registered = self.registered.lock().unwrap();
        let before = registered.len();
        registered.retain(|m| *m != mote);
        if registered.len() == before {
            return Err(EnvError::UnknownMote(mote));
        }
        Ok(())
    }

    fn registered_motes(&self) -> Vec<MoteId> {
        self.registered()
    }
}

pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_cpu(Platform::MicaZ, |_| Box::new(TestCpu::new(Platform::MicaZ)));
    registry.register_cpu(Platform::Sky, |_| Box::new(TestCpu::new(Platform::Sky)));
    registry
}

pub fn sky_type() -> Arc<MoteType> {
    Arc::new(MoteType::new("sky-test", Platform::Sky).with_variable("runs", 0x1100))
}

pub fn sky_mote(id: u32) -> Mote {
    sky_type().create_mote(&registry(), MoteId(id)).unwrap()
}

pub fn mote_with_cpu(id: u32, cpu: TestCpu) -> Mote {
    let mut registry = Registry::new();
    let cell = Mutex::new(Some(cpu));
    let platform = cell.lock().unwrap().as_ref().map(|c| c.platform).unwrap();
    registry.register_cpu(platform, move |_| {
        Box::new(cell.lock().unwrap().take().expect("cpu already used")) as Box<dyn CpuCore>
    });
    Arc::new(MoteType::new("custom", platform))
        .create_mote(&registry, MoteId(id))
        .unwrap()
}

pub fn simulation(config: SimConfig) -> (Simulation, TestMedium) {
    let medium = TestMedium::named("test");
    let sim = Simulation::new(config, Box::new(medium.clone())).unwrap();
    (sim, medium)
}
