//! The simulation handle and its run loop.
//!
//! # Threading
//!
//! A [`Simulation`] is a cheap, cloneable handle. While running, a single
//! dedicated thread (the simulation thread) owns the [`Kernel`] and
//! executes events one at a time. Other threads never touch the kernel
//! directly; they submit *poll requests*:
//!
//! ```text
//!   caller threads                 simulation thread
//!   ──────────────                 ─────────────────
//!   invoke_simulation_thread ──┐   loop {
//!   query / add_mote / ...   ──┼─►   drain poll requests (FIFO, all of them)
//!                              │     pop next event, advance time, execute
//!                              │     stop requested? -> exit
//!                              │   }
//!                              └─► (stopped: run immediately on the caller)
//! ```
//!
//! Poll requests always run before the next event and never during one.
//! A request accepted while the kernel is running always executes on the
//! simulation thread, even if the loop is already on its way out.

mod events;
mod kernel;

pub use events::{FnEvent, TimeEvent};
pub use kernel::{Kernel, MillisecondObserver, ObserverId};

use crate::config::{validate_buffer_size, validate_speed_limit, FaultPolicy, SimConfig};
use crate::error::{ConfigError, SimError, SimResult};
use crate::interfaces::LogOutputEvent;
use crate::mote::Mote;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use motesim_env::{MoteId, RadioMedium, SimTime, MILLISECOND};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// State changes published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimulationEvent {
    Started,
    /// `fault` is set when a genuine fault ended the run
    Stopped { fault: Option<String> },
    MoteAdded(MoteId),
    MoteRemoved(MoteId),
    RadioMediumChanged(String),
}

/// Subscriber list shared by the handle and the kernel.
#[derive(Clone, Default)]
pub(crate) struct Observers(Arc<Mutex<Vec<Sender<SimulationEvent>>>>);

impl Observers {
    fn subscribe(&self) -> Receiver<SimulationEvent> {
        let (tx, rx) = unbounded();
        lock(&self.0).push(tx);
        rx
    }

    /// Sends to every live subscriber, dropping the ones that hung up.
    pub(crate) fn notify(&self, event: SimulationEvent) {
        lock(&self.0).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Called with the fault that ended a run under [`FaultPolicy::ExitProcess`].
pub type FaultHandler = Arc<dyn Fn(&SimError) + Send + Sync>;

type PollRequest = Box<dyn FnOnce(&mut Kernel) + Send>;

struct Shared {
    kernel: Mutex<Kernel>,
    polls: Mutex<VecDeque<PollRequest>>,

    /// Only flipped while holding `polls`
    running: AtomicBool,
    stop: AtomicBool,
    clock: Arc<AtomicU64>,

    thread: Mutex<Option<JoinHandle<()>>>,
    sim_thread: Mutex<Option<ThreadId>>,

    observers: Observers,
    last_fault: Mutex<Option<Arc<SimError>>>,
    fault_handler: Mutex<Option<FaultHandler>>,

    title: String,
    fault_policy: FaultPolicy,
    timeout: Duration,
}

/// Handle to a simulation.
#[derive(Clone)]
pub struct Simulation {
    shared: Arc<Shared>,
}

impl Simulation {
    /// Creates a stopped simulation at time zero.
    pub fn new(config: SimConfig, radio: Box<dyn RadioMedium>) -> Result<Self, ConfigError> {
        let title = config.title.clone();
        let fault_policy = config.fault_policy;
        let timeout = Duration::from_millis(config.stop_timeout_ms);
        let kernel = Kernel::new(config, radio)?;

        Ok(Self {
            shared: Arc::new(Shared {
                clock: kernel.clock_handle(),
                observers: kernel.observers(),
                kernel: Mutex::new(kernel),
                polls: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                thread: Mutex::new(None),
                sim_thread: Mutex::new(None),
                last_fault: Mutex::new(None),
                fault_handler: Mutex::new(None),
                title,
                fault_policy,
                timeout,
            }),
        })
    }

    pub fn title(&self) -> &str {
        &self.shared.title
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        self.shared.fault_policy
    }

    /// Current simulated time. Safe to call from any thread; never decreases.
    pub fn time(&self) -> SimTime {
        self.shared.clock.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// True if called from the simulation thread.
    pub fn is_simulation_thread(&self) -> bool {
        *lock(&self.shared.sim_thread) == Some(thread::current().id())
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> Receiver<SimulationEvent> {
        self.shared.observers.subscribe()
    }

    /// Installs the handler called when a fault ends a run under
    /// [`FaultPolicy::ExitProcess`].
    pub fn set_fault_handler<F>(&self, handler: F)
    where
        F: Fn(&SimError) + Send + Sync + 'static,
    {
        *lock(&self.shared.fault_handler) = Some(Arc::new(handler));
    }

    /// Fault that ended the last run, if any.
    pub fn last_fault(&self) -> Option<Arc<SimError>> {
        lock(&self.shared.last_fault).clone()
    }

    pub fn clear_last_fault(&self) {
        *lock(&self.shared.last_fault) = None;
    }

    // ========================================================================
    // POLL REQUESTS
    // ========================================================================

    /// Runs `f` on the simulation thread before the next event, or right
    /// away on this thread if the simulation is stopped.
    pub fn invoke_simulation_thread<F>(&self, f: F)
    where
        F: FnOnce(&mut Kernel) + Send + 'static,
    {
        {
            let mut polls = lock(&self.shared.polls);
            if self.is_running() || self.is_simulation_thread() {
                polls.push_back(Box::new(f));
                return;
            }
        }
        let mut kernel = lock(&self.shared.kernel);
        f(&mut kernel);
    }

    /// Runs `f` with the kernel and returns its result.
    ///
    /// While running, `f` is a poll request and the caller waits for the
    /// reply (up to the configured stop timeout).
    ///
    /// # Errors
    /// - `NotOnSimulationThread` if called from the simulation thread
    /// - `Timeout` if the simulation thread did not get to it in time
    /// - `Disconnected` if the simulation thread dropped the request
    pub fn query<R, F>(&self, f: F) -> SimResult<R>
    where
        F: FnOnce(&mut Kernel) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_simulation_thread() {
            return Err(SimError::NotOnSimulationThread);
        }

        let mut polls = lock(&self.shared.polls);
        if !self.is_running() {
            drop(polls);
            let mut kernel = lock(&self.shared.kernel);
            return Ok(f(&mut kernel));
        }

        let (tx, rx) = bounded(1);
        polls.push_back(Box::new(move |kernel: &mut Kernel| {
            let _ = tx.send(f(kernel));
        }));
        drop(polls);

        rx.recv_timeout(self.shared.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SimError::Timeout(self.shared.timeout.as_millis() as u64),
            RecvTimeoutError::Disconnected => SimError::Disconnected,
        })
    }

    // ========================================================================
    // CONTROL
    // ========================================================================

    /// Starts the run loop on a new simulation thread. No-op if running.
    pub fn start(&self) -> SimResult<()> {
        if self.is_simulation_thread() {
            return Err(SimError::NotOnSimulationThread);
        }

        let mut thread_slot = lock(&self.shared.thread);
        if self.is_running() {
            return Ok(());
        }
        if let Some(previous) = thread_slot.take() {
            // Already past its loop; this only waits for its exit path
            let _ = previous.join();
        }

        {
            let _polls = lock(&self.shared.polls);
            self.shared.stop.store(false, Ordering::Release);
            self.shared.running.store(true, Ordering::Release);
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("simulation".to_string())
            .spawn(move || run(shared));

        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                let _polls = lock(&self.shared.polls);
                self.shared.running.store(false, Ordering::Release);
                Err(SimError::ThreadSpawn(e))
            }
        }
    }

    /// Asks the run loop to stop after the current event.
    ///
    /// With `block`, waits (up to the configured timeout) for the
    /// simulation thread to finish. Blocking from the simulation thread
    /// itself only sets the flag.
    pub fn stop_simulation(&self, block: bool) -> SimResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.shared.stop.store(true, Ordering::Release);
        if !block || self.is_simulation_thread() {
            return Ok(());
        }

        let deadline = Instant::now() + self.shared.timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return Err(SimError::Timeout(self.shared.timeout.as_millis() as u64));
            }
            thread::sleep(Duration::from_millis(1));
        }

        let handle = lock(&self.shared.thread).take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| SimError::Panicked("simulation thread".to_string()))?;
        }
        Ok(())
    }

    /// Runs one simulated millisecond, then stops. Returns `false` (and
    /// does nothing) if the simulation is already running.
    pub fn step_millisecond(&self) -> SimResult<bool> {
        if self.is_running() {
            return Ok(false);
        }
        {
            let mut kernel = lock(&self.shared.kernel);
            let until = kernel.time() + MILLISECOND;
            kernel.schedule_stop(until)?;
        }
        self.start()?;
        Ok(true)
    }

    /// Waits until the current run ends (or the timeout passes).
    pub fn wait_until_stopped(&self, timeout: Duration) -> SimResult<()> {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return Err(SimError::Timeout(timeout.as_millis() as u64));
            }
            thread::sleep(Duration::from_millis(1));
        }
        let handle = lock(&self.shared.thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    // ========================================================================
    // KERNEL OPERATIONS
    // ========================================================================

    /// Adds a mote (marshalled to the simulation thread while running).
    pub fn add_mote(&self, mote: Mote) -> SimResult<MoteId> {
        self.query(move |kernel| kernel.add_mote(mote))?
    }

    /// Removes a mote and every event that belongs to it.
    pub fn remove_mote(&self, id: MoteId) -> SimResult<Mote> {
        self.query(move |kernel| kernel.remove_mote(id))?
    }

    /// Changes the speed limit. The value is checked here, before it is
    /// handed to the simulation thread.
    pub fn set_speed_limit(&self, limit: Option<f64>) -> Result<(), ConfigError> {
        validate_speed_limit(limit)?;
        self.invoke_simulation_thread(move |kernel| {
            if let Err(e) = kernel.set_speed_limit(limit) {
                warn!("Speed limit rejected: {}", e);
            }
        });
        Ok(())
    }

    /// Replaces the radio medium. Returns the previous one.
    pub fn set_radio_medium(&self, medium: Box<dyn RadioMedium>) -> SimResult<Box<dyn RadioMedium>> {
        self.query(move |kernel| kernel.set_radio_medium(medium))?
    }

    /// Changes the log output history capacity.
    pub fn set_log_output_buffer_size(&self, size: usize) -> Result<(), ConfigError> {
        validate_buffer_size(size)?;
        self.invoke_simulation_thread(move |kernel| {
            if let Err(e) = kernel.set_log_output_buffer_size(size) {
                warn!("Log buffer size rejected: {}", e);
            }
        });
        Ok(())
    }

    /// Point-in-time snapshot of the log output history, oldest first.
    pub fn log_output_history(&self) -> SimResult<Vec<LogOutputEvent>> {
        self.query(|kernel| kernel.log_output_history())
    }

    pub fn mote_count(&self) -> SimResult<usize> {
        self.query(|kernel| kernel.mote_count())
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("title", &self.shared.title)
            .field("time", &self.time())
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// RUN LOOP
// ============================================================================

fn run(shared: Arc<Shared>) {
    let mut kernel = lock(&shared.kernel);
    *lock(&shared.sim_thread) = Some(thread::current().id());
    shared.observers.notify(SimulationEvent::Started);

    let started = Instant::now();
    let start_time = kernel.time();
    info!(time = start_time, "Simulation started");

    let result = run_loop(&shared, &mut kernel);

    {
        let _polls = lock(&shared.polls);
        shared.running.store(false, Ordering::Release);
    }
    // Requests accepted before the flip still run here
    if let Err(e) = drain_polls(&shared, &mut kernel) {
        error!("Poll request failed during shutdown: {}", e);
    }
    shared.stop.store(false, Ordering::Release);
    kernel.take_stop_request();

    let end_time = kernel.time();
    *lock(&shared.sim_thread) = None;
    drop(kernel);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let fault = match result {
        Ok(()) => {
            info!(time = end_time, elapsed_ms, "Simulation stopped");
            None
        }
        Err(e) if e.is_requested_stop() => {
            info!(time = end_time, elapsed_ms, "Simulation stopped: {}", e);
            None
        }
        Err(e) => {
            error!(
                time = end_time,
                mote = ?e.mote(),
                elapsed_ms,
                "Simulation failed: {}",
                e
            );
            Some(Arc::new(e))
        }
    };

    let message = fault.as_ref().map(|e| e.to_string());
    if let Some(fault) = &fault {
        *lock(&shared.last_fault) = Some(Arc::clone(fault));
    }
    shared.observers.notify(SimulationEvent::Stopped { fault: message });

    if let (Some(fault), FaultPolicy::ExitProcess) = (fault, shared.fault_policy) {
        // Called unlocked so the handler may replace itself
        let handler = lock(&shared.fault_handler).clone();
        match handler {
            Some(handler) => handler(fault.as_ref()),
            None => warn!("No fault handler installed; leaving the simulation stopped"),
        }
    }
}

fn run_loop(shared: &Shared, kernel: &mut Kernel) -> SimResult<()> {
    loop {
        drain_polls(shared, kernel)?;
        if stop_requested(shared, kernel) {
            return Ok(());
        }

        kernel.step()?;

        if stop_requested(shared, kernel) {
            return Ok(());
        }
    }
}

fn stop_requested(shared: &Shared, kernel: &mut Kernel) -> bool {
    // Evaluate both so a kernel-side request never lingers into the next run
    let kernel_stop = kernel.take_stop_request();
    shared.stop.load(Ordering::Acquire) || kernel_stop
}

/// Runs every queued poll request, including ones queued by the requests
/// themselves.
fn drain_polls(shared: &Shared, kernel: &mut Kernel) -> SimResult<()> {
    loop {
        let request = lock(&shared.polls).pop_front();
        let Some(request) = request else {
            return Ok(());
        };
        panic::catch_unwind(AssertUnwindSafe(|| request(kernel)))
            .map_err(|_| SimError::Panicked("poll request".to_string()))?;
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
/// Kernel state is consistent between events, so a poisoned lock carries
/// no half-applied update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
