//! Scenario runner - builds, runs and checks headless scenarios.

use crate::cpu::{Script, COUNTER_VARIABLE};
use crate::radio::{BroadcastMedium, SilentMedium, BROADCAST, SILENT};
use crate::scenarios::ScenarioId;

use crossbeam::channel::Receiver;
use motesim_core::{
    ConfigError, FaultPolicy, FnEvent, InterfaceSpec, Kernel, LedBank, LogOutputEvent, LogOutputListener, Mote,
    MoteCountListener, MoteState, MoteType, Registry, SimConfig, SimError, Simulation, SimulationEvent,
};
use motesim_env::{CpuCore, MoteId, Platform, RadioMedium, SimTime, MILLISECOND, SECOND};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// History capacity used by the log flood scenario.
pub const FLOOD_BUFFER_SIZE: usize = 32;

/// Speed limit used when none is given.
pub const DEFAULT_SPEED_LIMIT: f64 = 4.0;

/// Hearing range of the broadcast medium, in mote ids.
pub const BROADCAST_RANGE: u32 = 3;

/// Shortest run the scenarios' checks make sense for.
const MIN_DURATION_MS: u64 = 50;

/// Setup failures. A scenario that cannot be built fails with this as its
/// reason.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Sim(#[from] SimError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Simulated milliseconds observed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub motes_added: u64,
    pub motes_removed: u64,

    /// Log lines delivered to listeners
    pub log_lines: u64,

    /// Log lines pushed out of the bounded history
    pub log_lines_evicted: u64,

    pub history_len: usize,

    /// Most motes in low-power mode at a millisecond boundary
    pub peak_sleeping_motes: u64,

    pub led_changes: u64,
    pub audible_pairs: usize,
    pub pending_events: usize,
    pub wall_clock_ms: u64,
}

/// Shared fault callback, installed on every simulation under
/// [`FaultPolicy::ExitProcess`].
pub type SharedFaultHandler = Arc<dyn Fn(&SimError) + Send + Sync>;

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of motes
    num_motes: usize,

    platform: Platform,

    /// Simulated duration in milliseconds
    duration_ms: u64,

    speed_limit: Option<f64>,

    /// Base kernel configuration; each scenario adjusts its own copy
    config: SimConfig,

    fault_handler: Option<SharedFaultHandler>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_motes: usize) -> Self {
        Self {
            seed,
            num_motes: num_motes.max(1),
            platform: Platform::Sky,
            duration_ms: 2_000,
            speed_limit: None,
            config: SimConfig::default(),
            fault_handler: None,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Sets the simulated duration.
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms.max(MIN_DURATION_MS);
        self
    }

    /// Caps every scenario's speed (and sets the speed-limited scenario's).
    pub fn with_speed_limit(mut self, limit: Option<f64>) -> Self {
        self.speed_limit = limit;
        self
    }

    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_fault_handler(mut self, handler: SharedFaultHandler) -> Self {
        self.fault_handler = Some(handler);
        self
    }

    fn duration(&self) -> SimTime {
        self.duration_ms * MILLISECOND
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(
            "Starting scenario: {} (seed={}, motes={}, platform={})",
            scenario.name(),
            self.seed,
            self.num_motes,
            self.platform
        );

        let outcome = match scenario {
            ScenarioId::BootStorm => self.run_boot_storm(),
            ScenarioId::LogFlood => self.run_log_flood(),
            ScenarioId::MoteChurn => self.run_mote_churn(),
            ScenarioId::SpeedLimited => self.run_speed_limited(),
            ScenarioId::FaultInjection => self.run_fault_injection(),
            ScenarioId::Breakpoint => self.run_breakpoint(),
        };

        match outcome {
            Ok((run, verdict)) => {
                let verdict = verdict.and_then(|_| run.ended_as_expected(scenario, self.duration()));
                run.into_result(scenario, self.seed, verdict)
            }
            Err(e) => {
                warn!("Scenario {} could not run: {}", scenario.name(), e);
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    failure_reason: Some(format!("setup failed: {}", e)),
                    metrics: ScenarioMetrics::default(),
                }
            }
        }
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    /// Every mote boots inside the startup window and logs at least once.
    fn run_boot_storm(&self) -> Result<(Run, Verdict), RunError> {
        let config = self.config(ScenarioId::BootStorm).with_max_startup_delay(self.duration() / 2);
        let mut run = self.prepare(config, Script::new(self.seed), Medium::Broadcast)?;
        run.add_motes(1..=self.num_motes as u32)?;
        run.run_for(self.duration(), self.wall_timeout(None))?;

        let loggers = run.probe.loggers();
        let silent: Vec<_> = (1..=self.num_motes as u32)
            .map(MoteId)
            .filter(|m| !loggers.contains(m))
            .collect();

        let verdict = run
            .no_fault()
            .and_then(|_| check(silent.is_empty(), || format!("motes never logged: {:?}", silent)));
        Ok((run, verdict))
    }

    /// The bounded history keeps exactly the newest lines.
    fn run_log_flood(&self) -> Result<(Run, Verdict), RunError> {
        let config = self
            .config(ScenarioId::LogFlood)
            .with_max_startup_delay(0)
            .with_log_buffer_size(FLOOD_BUFFER_SIZE);
        let script = Script::new(self.seed).with_line_every(1).with_max_sleep_ms(0);
        let mut run = self.prepare(config, script, Medium::Silent)?;
        run.add_motes(1..=self.num_motes as u32)?;
        run.run_for(self.duration(), self.wall_timeout(None))?;

        let history = run.sim.log_output_history()?;
        let lines = run.probe.lines();
        let evicted = run.probe.evicted();

        let verdict = run
            .no_fault()
            .and_then(|_| check(lines > FLOOD_BUFFER_SIZE as u64, || format!("only {} lines", lines)))
            .and_then(|_| {
                check(history.len() == FLOOD_BUFFER_SIZE, || {
                    format!("history holds {} lines, expected {}", history.len(), FLOOD_BUFFER_SIZE)
                })
            })
            .and_then(|_| {
                check(evicted + FLOOD_BUFFER_SIZE as u64 == lines, || {
                    format!("{} lines delivered but {} evicted", lines, evicted)
                })
            })
            .and_then(|_| {
                check(history.windows(2).all(|w| w[0].time <= w[1].time), || {
                    "history out of time order".to_string()
                })
            });
        Ok((run, verdict))
    }

    /// The oldest mote is replaced by a fresh one every tenth of the run.
    fn run_mote_churn(&self) -> Result<(Run, Verdict), RunError> {
        let config = self
            .config(ScenarioId::MoteChurn)
            .with_max_startup_delay(10 * MILLISECOND);
        let mut run = self.prepare(config, Script::new(self.seed), Medium::Broadcast)?;
        run.add_motes(1..=self.num_motes as u32)?;

        let period = (self.duration() / 10).max(MILLISECOND);
        let registry = Arc::clone(&run.registry);
        let mote_type = Arc::clone(&run.mote_type);
        let mut next_id = self.num_motes as u32 + 1;
        let churn = FnEvent::new("churn", move |k: &mut Kernel, this, time| {
            if let Some(oldest) = k.motes().first().map(Mote::id) {
                k.remove_mote(oldest)?;
            }
            let mote = mote_type.create_mote(&registry, MoteId(next_id))?;
            next_id += 1;
            k.add_mote(mote)?;
            k.schedule(this, time + period)
        });
        run.sim
            .query(move |k| k.schedule_event(Box::new(churn), period))??;
        run.run_for(self.duration(), self.wall_timeout(None))?;

        let added = run.probe.added.load(Ordering::Relaxed);
        let removed = run.probe.removed.load(Ordering::Relaxed);
        let remaining = run.sim.mote_count()?;
        let registered = run.registrations().len();

        let verdict = run
            .no_fault()
            .and_then(|_| check(removed > 0, || "no mote was replaced".to_string()))
            .and_then(|_| {
                check(added == self.num_motes as u64 + removed, || {
                    format!("{} added for {} removed", added, removed)
                })
            })
            .and_then(|_| {
                check(remaining == self.num_motes && registered == remaining, || {
                    format!("{} motes left, {} registered with the radio", remaining, registered)
                })
            });
        Ok((run, verdict))
    }

    /// Simulated time does not outrun the wall clock times the limit.
    fn run_speed_limited(&self) -> Result<(Run, Verdict), RunError> {
        let limit = self.speed_limit.unwrap_or(DEFAULT_SPEED_LIMIT);
        let config = self
            .config(ScenarioId::SpeedLimited)
            .with_max_startup_delay(10 * MILLISECOND)
            .with_speed_limit(Some(limit));
        let mut run = self.prepare(config, Script::new(self.seed), Medium::Silent)?;
        run.add_motes(1..=self.num_motes as u32)?;
        run.run_for(self.duration(), self.wall_timeout(Some(limit)))?;

        let expected = Duration::from_secs_f64(self.duration_ms as f64 / limit / 1000.0);
        let floor = expected.mul_f64(0.8);
        let verdict = run
            .no_fault()
            .and_then(|_| {
                check(run.elapsed >= floor, || {
                    format!("ran in {:?}, limit allows no less than {:?}", run.elapsed, floor)
                })
            });
        Ok((run, verdict))
    }

    /// A crashing CPU ends the run with a fault that names its mote.
    fn run_fault_injection(&self) -> Result<(Run, Verdict), RunError> {
        // The fault is the expected outcome, so it never takes the process down
        let config = self
            .config(ScenarioId::FaultInjection)
            .with_max_startup_delay(self.duration() / 4)
            .with_fault_policy(FaultPolicy::KeepStopped);
        let victim = MoteId(self.num_motes as u32 / 2 + 1);
        let cap = self.platform.cycles_per(self.duration() / 2);
        let script = Script::new(self.seed).with_crash(victim, cap);

        let mut run = self.prepare(config, script, Medium::Silent)?;
        run.add_motes(1..=self.num_motes as u32)?;
        run.run_for(self.duration(), self.wall_timeout(None))?;

        let stopped_with = run.stopped_fault();
        let verdict = match run.sim.last_fault().as_deref() {
            Some(SimError::MoteFault { mote, .. }) if *mote == victim => {
                check(stopped_with.flatten().is_some(), || "stop notification carried no fault".to_string())
            }
            Some(other) => Err(format!("unexpected fault: {}", other)),
            None => Err(format!("{} never crashed", victim)),
        };
        Ok((run, verdict))
    }

    /// A breakpoint stops the run early without recording a fault.
    fn run_breakpoint(&self) -> Result<(Run, Verdict), RunError> {
        let config = self.config(ScenarioId::Breakpoint).with_max_startup_delay(0);
        let script = Script::new(self.seed).with_breakpoint(MoteId(1), 3);
        let mut run = self.prepare(config, script, Medium::Silent)?;
        run.add_motes(1..=self.num_motes as u32)?;
        run.run_for(self.duration(), self.wall_timeout(None))?;

        let stopped_with = run.stopped_fault();
        let verdict = run.no_fault().and_then(|_| {
            check(stopped_with == Some(None), || {
                format!("stop notification carried {:?}", stopped_with)
            })
        });
        Ok((run, verdict))
    }

    // ========================================================================
    // PLUMBING
    // ========================================================================

    fn config(&self, scenario: ScenarioId) -> SimConfig {
        let mut config = self.config.clone().with_seed(self.seed);
        config.title = format!("{} ({} motes, seed {})", scenario.name(), self.num_motes, self.seed);
        if self.speed_limit.is_some() {
            config.speed_limit = self.speed_limit;
        }
        config
    }

    fn wall_timeout(&self, limit: Option<f64>) -> Duration {
        let throttled = limit.map_or(Duration::ZERO, |l| {
            Duration::from_secs_f64(self.duration_ms as f64 / l / 1000.0)
        });
        Duration::from_secs(60) + throttled
    }

    fn prepare(&self, config: SimConfig, script: Script, medium: Medium) -> Result<Run, RunError> {
        let registry = Arc::new(registry(&script));
        let mote_type = Arc::new(
            MoteType::new(format!("{}-scripted", self.platform), self.platform)
                .with_description("Scripted stand-in firmware")
                .with_variable(COUNTER_VARIABLE, script.counter_address)
                .with_interface(InterfaceSpec::Leds {
                    address: script.led_address(),
                }),
        );

        let (radio, broadcast) = match medium {
            Medium::Silent => (registry.create_radio_medium(SILENT)?, None),
            Medium::Broadcast => {
                let broadcast = BroadcastMedium::new(BROADCAST_RANGE);
                (Box::new(broadcast.clone()) as Box<dyn RadioMedium>, Some(broadcast))
            }
        };

        let policy = config.fault_policy;
        let sim = Simulation::new(config, radio)?;
        if let (FaultPolicy::ExitProcess, Some(handler)) = (policy, &self.fault_handler) {
            let handler = Arc::clone(handler);
            sim.set_fault_handler(move |e| handler(e));
        }

        let probe = Probe::default();
        let events = sim.subscribe();
        let listener = probe.clone();
        let observer = probe.clone();
        sim.query(move |k| {
            k.add_mote_count_listener(Box::new(listener.clone()));
            k.add_log_output_listener(Box::new(listener));
            k.add_millisecond_observer(Box::new(move |_time: SimTime, motes: &[Mote]| observer.sample(motes)));
        })?;

        Ok(Run {
            sim,
            registry,
            mote_type,
            probe,
            events,
            broadcast,
            elapsed: Duration::ZERO,
            final_time: 0,
        })
    }
}

/// Builds a registry whose CPUs follow `script` on both platforms.
pub fn registry(script: &Script) -> Registry {
    let mut registry = Registry::new();
    for platform in [Platform::MicaZ, Platform::Sky] {
        let script = script.clone();
        registry.register_cpu(platform, move |mote| Box::new(script.cpu(platform, mote)) as Box<dyn CpuCore>);
    }
    registry.register_radio_medium(SILENT, || Box::new(SilentMedium::new()));
    registry.register_radio_medium(BROADCAST, || Box::new(BroadcastMedium::new(BROADCAST_RANGE)));
    registry
}

enum Medium {
    Silent,
    Broadcast,
}

type Verdict = Result<(), String>;

fn check(ok: bool, reason: impl FnOnce() -> String) -> Verdict {
    if ok {
        Ok(())
    } else {
        Err(reason())
    }
}

/// One built simulation plus everything watching it.
struct Run {
    sim: Simulation,
    registry: Arc<Registry>,
    mote_type: Arc<MoteType>,
    probe: Probe,
    events: Receiver<SimulationEvent>,
    broadcast: Option<BroadcastMedium>,
    elapsed: Duration,
    final_time: SimTime,
}

impl Run {
    fn add_motes(&mut self, ids: impl IntoIterator<Item = u32>) -> Result<(), RunError> {
        for id in ids {
            let mote = self.mote_type.create_mote(&self.registry, MoteId(id))?;
            self.sim.add_mote(mote)?;
        }
        Ok(())
    }

    fn run_for(&mut self, duration: SimTime, timeout: Duration) -> Result<(), RunError> {
        self.sim.query(move |k| k.schedule_stop(duration))??;
        let started = Instant::now();
        self.sim.start()?;
        self.sim.wait_until_stopped(timeout)?;
        self.elapsed = started.elapsed();
        self.final_time = self.sim.time();
        debug!(
            time = self.final_time,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "Scenario run finished"
        );
        Ok(())
    }

    fn registrations(&self) -> Vec<MoteId> {
        match &self.broadcast {
            Some(medium) => medium.registrations().snapshot(),
            None => Vec::new(),
        }
    }

    /// `Some(fault)` from the last stop notification, `None` if none arrived.
    fn stopped_fault(&self) -> Option<Option<String>> {
        self.events.try_iter().fold(None, |last, event| match event {
            SimulationEvent::Stopped { fault } => Some(fault),
            _ => last,
        })
    }

    fn no_fault(&self) -> Verdict {
        match self.sim.last_fault() {
            Some(fault) => Err(format!("unexpected fault: {}", fault)),
            None => Ok(()),
        }
    }

    /// Early stoppers must end before `duration`, everything else exactly on it.
    fn ended_as_expected(&self, scenario: ScenarioId, duration: SimTime) -> Verdict {
        if scenario.stops_early() {
            check(self.final_time < duration, || {
                format!("{} ran to the end at {} us", scenario, self.final_time)
            })
        } else {
            check(self.final_time == duration, || {
                format!("stopped at {} us, expected {}", self.final_time, duration)
            })
        }
    }

    fn into_result(self, scenario: ScenarioId, seed: u64, verdict: Verdict) -> ScenarioResult {
        let snapshot = self
            .sim
            .query(|k| {
                let leds: u64 = k
                    .motes()
                    .iter()
                    .filter_map(|m| m.interfaces().get::<LedBank>())
                    .map(LedBank::changes)
                    .sum();
                (k.log_output_history().len(), k.pending_events(), leds)
            })
            .ok();
        let (history_len, pending_events, led_changes) = snapshot.unwrap_or_default();

        let metrics = ScenarioMetrics {
            motes_added: self.probe.added.load(Ordering::Relaxed),
            motes_removed: self.probe.removed.load(Ordering::Relaxed),
            log_lines: self.probe.lines(),
            log_lines_evicted: self.probe.evicted(),
            history_len,
            peak_sleeping_motes: self.probe.peak_sleeping.load(Ordering::Relaxed),
            led_changes,
            audible_pairs: self.broadcast.as_ref().map_or(0, BroadcastMedium::audible_pairs),
            pending_events,
            wall_clock_ms: self.elapsed.as_millis() as u64,
        };

        ScenarioResult {
            scenario,
            seed,
            passed: verdict.is_ok(),
            total_ticks: self.probe.ticks.load(Ordering::Relaxed),
            final_time_secs: self.final_time as f64 / SECOND as f64,
            failure_reason: verdict.err(),
            metrics,
        }
    }
}

/// Listener and millisecond observer feeding the scenario checks.
#[derive(Clone, Default)]
struct Probe(Arc<ProbeCounts>);

#[derive(Default)]
struct ProbeCounts {
    added: AtomicU64,
    removed: AtomicU64,
    lines: AtomicU64,
    evicted: AtomicU64,
    ticks: AtomicU64,
    peak_sleeping: AtomicU64,
    loggers: Mutex<BTreeSet<MoteId>>,
}

impl std::ops::Deref for Probe {
    type Target = ProbeCounts;

    fn deref(&self) -> &ProbeCounts {
        &self.0
    }
}

impl Probe {
    fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn loggers(&self) -> BTreeSet<MoteId> {
        self.loggers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn sample(&self, motes: &[Mote]) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let sleeping = motes.iter().filter(|m| m.state() == MoteState::LowPower).count() as u64;
        self.peak_sleeping.fetch_max(sleeping, Ordering::Relaxed);
    }
}

impl MoteCountListener for Probe {
    fn mote_added(&mut self, _mote: MoteId) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    fn mote_removed(&mut self, _mote: MoteId) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }
}

impl LogOutputListener for Probe {
    fn new_log_output(&mut self, event: &LogOutputEvent) {
        self.lines.fetch_add(1, Ordering::Relaxed);
        self.loggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.mote);
    }

    fn removed_log_output(&mut self, _event: &LogOutputEvent) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(42, 4).with_duration_ms(200)
    }

    #[test]
    fn test_boot_storm_passes() {
        let result = runner().run(ScenarioId::BootStorm);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.motes_added, 4);
        assert!(result.metrics.log_lines >= 4);
        assert!(result.total_ticks > 0);
        // Ids 1-4 are all within hearing range of each other
        assert_eq!(result.metrics.audible_pairs, 6);
    }

    #[test]
    fn test_log_flood_keeps_newest() {
        let result = runner().run(ScenarioId::LogFlood);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.history_len, FLOOD_BUFFER_SIZE);
        assert_eq!(
            result.metrics.log_lines - result.metrics.log_lines_evicted,
            FLOOD_BUFFER_SIZE as u64
        );
    }

    #[test]
    fn test_fault_and_breakpoint_scenarios() {
        for scenario in [ScenarioId::FaultInjection, ScenarioId::Breakpoint] {
            let result = runner().with_platform(Platform::MicaZ).run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
            assert!(result.final_time_secs < 0.2);
        }
    }

    #[test]
    fn test_same_seed_same_metrics() {
        let a = runner().run(ScenarioId::MoteChurn);
        let b = runner().run(ScenarioId::MoteChurn);
        assert!(a.passed, "{:?}", a.failure_reason);
        assert_eq!(a.metrics.log_lines, b.metrics.log_lines);
        assert_eq!(a.metrics.motes_removed, b.metrics.motes_removed);
        assert_eq!(a.metrics.led_changes, b.metrics.led_changes);
    }

    #[test]
    fn test_result_serializes() {
        let result = runner().run(ScenarioId::Breakpoint);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["scenario"], "breakpoint");
        assert_eq!(json["seed"], 42);
        assert!(json["metrics"]["motes_added"].is_u64());
    }

    #[test]
    fn test_registry_covers_both_platforms() {
        let registry = registry(&Script::new(1));
        assert!(registry.supports(Platform::MicaZ));
        assert!(registry.supports(Platform::Sky));
        assert_eq!(registry.radio_media(), vec![BROADCAST, SILENT]);
        assert_eq!(crate::cpu::COUNTER_ADDRESS, Script::new(1).counter_address);
    }
}
