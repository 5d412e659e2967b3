//! The simulation kernel.
//!
//! [`Kernel`] owns everything that affects scheduling: the event queue, the
//! motes, the radio medium and the random generator. Exactly one thread
//! may touch it while a simulation runs; the [`Simulation`](super::Simulation)
//! handle enforces that by keeping the kernel behind a lock held by the
//! simulation thread for the whole run.
//!
//! The kernel can also be driven directly with [`Kernel::step`], which is
//! how the run loop uses it.

use super::events::{DelayEvent, MillisecondEvent, MoteTickEvent, SpeedAnchor, StopEvent, TimeEvent};
use super::{Observers, SimulationEvent};
use crate::config::{validate_speed_limit, SimConfig};
use crate::error::{ConfigError, SimError, SimResult};
use crate::event_central::{ListenerId, LogOutputListener, MoteCountListener, SimEventCentral};
use crate::event_queue::{EventId, EventQueue};
use crate::interfaces::LogOutputEvent;
use crate::mote::{Mote, MoteType};
use motesim_env::{MoteId, RadioMedium, SimTime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Handle returned by [`Kernel::add_millisecond_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Callback fired once per simulated millisecond.
pub type MillisecondObserver = Box<dyn FnMut(SimTime, &[Mote]) + Send>;

pub struct Kernel {
    config: SimConfig,

    queue: EventQueue<Box<dyn TimeEvent>>,
    current_time: SimTime,
    /// Lock-free mirror of `current_time` for other threads
    clock: Arc<AtomicU64>,
    /// Event being executed and the mote it belongs to
    executing: Option<(EventId, Option<MoteId>)>,
    stop_requested: bool,

    motes: Vec<Mote>,
    mote_types: Vec<Arc<MoteType>>,
    radio: Box<dyn RadioMedium>,
    events: SimEventCentral,

    rng: ChaCha8Rng,
    random_seed: u64,
    random_seed_generated: bool,

    speed_limit: Option<f64>,
    pub(crate) speed_anchor: Option<SpeedAnchor>,
    delay_event: EventId,

    ms_observers: Vec<(ObserverId, MillisecondObserver)>,
    ms_event: EventId,
    next_observer: u64,

    observers: Observers,
}

impl Kernel {
    /// Creates a stopped kernel at time zero with no motes.
    pub fn new(config: SimConfig, radio: Box<dyn RadioMedium>) -> Result<Self, ConfigError> {
        config.validate()?;

        let random_seed = if config.random_seed_generated {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(config.random_seed)
        } else {
            config.random_seed
        };

        let mut queue: EventQueue<Box<dyn TimeEvent>> = EventQueue::new();
        let delay_event = queue.register(Box::new(DelayEvent));
        let ms_event = queue.register(Box::new(MillisecondEvent));

        let mut kernel = Self {
            events: SimEventCentral::new(config.log_output_buffer_size)?,
            speed_limit: None,
            rng: ChaCha8Rng::seed_from_u64(random_seed),
            random_seed,
            random_seed_generated: config.random_seed_generated,
            queue,
            current_time: 0,
            clock: Arc::new(AtomicU64::new(0)),
            executing: None,
            stop_requested: false,
            motes: Vec::new(),
            mote_types: Vec::new(),
            radio,
            speed_anchor: None,
            delay_event,
            ms_observers: Vec::new(),
            ms_event,
            next_observer: 1,
            observers: Observers::default(),
            config,
        };
        kernel.set_speed_limit(kernel.config.speed_limit)?;
        Ok(kernel)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn title(&self) -> &str {
        &self.config.title
    }

    /// Current simulated time in microseconds.
    pub fn time(&self) -> SimTime {
        self.current_time
    }

    pub(crate) fn clock_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.clock)
    }

    pub(crate) fn observers(&self) -> Observers {
        self.observers.clone()
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    /// Registers an event without scheduling it.
    pub fn register_event(&mut self, event: Box<dyn TimeEvent>) -> EventId {
        self.queue.register(event)
    }

    /// Registers and schedules an event.
    pub fn schedule_event(&mut self, event: Box<dyn TimeEvent>, time: SimTime) -> SimResult<EventId> {
        let id = self.queue.register(event);
        self.queue.add_event(id, time)?;
        Ok(id)
    }

    /// Schedules a registered event.
    ///
    /// # Errors
    /// `SchedulingError::AlreadyScheduled` if the event is already
    /// scheduled; the queue is unchanged.
    pub fn schedule(&mut self, event: EventId, time: SimTime) -> SimResult<()> {
        self.queue.add_event(event, time)?;
        Ok(())
    }

    /// Unschedules an event. Returns `false` if it was not scheduled.
    pub fn unschedule(&mut self, event: EventId) -> bool {
        self.queue.remove(event)
    }

    /// Unschedules and destroys an event. Releasing the executing event is
    /// allowed; it is dropped once it returns.
    pub fn release_event(&mut self, event: EventId) -> bool {
        let registered = self.queue.is_registered(event);
        self.queue.release(event);
        registered
    }

    pub fn is_scheduled(&self, event: EventId) -> bool {
        self.queue.is_scheduled(event)
    }

    /// Read access to the queue.
    pub fn event_queue(&self) -> &EventQueue<Box<dyn TimeEvent>> {
        &self.queue
    }

    /// Scheduled event count.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Unschedules every event. The events stay registered.
    pub fn clear_events(&mut self) {
        self.queue.remove_all();
    }

    /// Asks the run loop to stop after the current event.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub(crate) fn take_stop_request(&mut self) -> bool {
        std::mem::take(&mut self.stop_requested)
    }

    /// Schedules a one-shot stop at `time`.
    pub fn schedule_stop(&mut self, time: SimTime) -> SimResult<EventId> {
        self.schedule_event(Box::new(StopEvent), time)
    }

    /// Pops and executes the next event.
    ///
    /// # Errors
    /// - `EmptyQueue` if nothing is scheduled
    /// - `TimeWentBackward` if the next event lies before the current time
    /// - whatever the event itself returns
    pub fn step(&mut self) -> SimResult<()> {
        let (id, time) = self.queue.pop_first().ok_or(SimError::EmptyQueue {
            time: self.current_time,
        })?;

        if time < self.current_time {
            let event = self
                .queue
                .get(id)
                .map_or_else(|| id.to_string(), |e| e.name().to_string());
            return Err(SimError::TimeWentBackward {
                event,
                event_time: time,
                current: self.current_time,
            });
        }

        self.current_time = time;
        self.clock.store(time, Ordering::Release);

        let Some(mut event) = self.queue.take(id) else {
            return Ok(());
        };
        self.executing = Some((id, event.mote()));
        trace!(event = event.name(), time, "Executing event");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| event.execute(self, id, time)));
        self.executing = None;

        let result = match outcome {
            Ok(Err(SimError::Scheduling(source))) => Err(SimError::EventFailed {
                event: event.name().to_string(),
                time,
                mote: event.mote(),
                source,
            }),
            Ok(result) => result,
            Err(payload) => Err(SimError::Panicked(format!(
                "{} at {}: {}",
                event.name(),
                time,
                panic_message(payload.as_ref())
            ))),
        };

        // Fails only if the event was released while running; it is dropped here
        let _ = self.queue.restore(id, event);
        self.events.flush_pending();
        result
    }

    // ========================================================================
    // MOTES
    // ========================================================================

    /// Adds a mote and starts ticking it.
    ///
    /// The mote clock is offset so that it boots a random delay in
    /// `[0, max_mote_startup_delay)` after now.
    pub fn add_mote(&mut self, mut mote: Mote) -> SimResult<MoteId> {
        let id = mote.id();
        if self.mote(id).is_some() {
            return Err(SimError::DuplicateMote(id));
        }

        let max_delay = self.config.max_mote_startup_delay;
        let startup = if max_delay > 0 {
            self.rng.gen_range(0..max_delay)
        } else {
            0
        };
        let drift = -(self.current_time as i64) - startup as i64;
        mote.set_clock_drift(drift);
        mote.interfaces_mut()
            .set_cache_enabled(self.config.cache_active_interfaces);

        self.radio.register_mote(id)?;
        self.add_mote_type(Arc::clone(mote.mote_type()));
        mote.interfaces_mut().added(id);
        self.events.mote_added(&mut mote);

        let tick = self.queue.register(Box::new(MoteTickEvent::new(id)));
        self.queue.add_event(tick, self.current_time)?;
        mote.set_tick_event(Some(tick));

        self.motes.push(mote);
        self.observers.notify(SimulationEvent::MoteAdded(id));
        debug!(mote = %id, drift, "Mote added");
        Ok(id)
    }

    /// Removes a mote and every event that belongs to it.
    pub fn remove_mote(&mut self, id: MoteId) -> SimResult<Mote> {
        let index = self
            .motes
            .iter()
            .position(|m| m.id() == id)
            .ok_or(SimError::UnknownMote(id))?;
        let mut mote = self.motes.remove(index);

        if let Err(e) = self.radio.unregister_mote(id) {
            warn!(mote = %id, "Radio medium refused unregistration: {}", e);
        }
        mote.interfaces_mut().removed(id);
        self.events.mote_removed(&mut mote);

        let mut swept = 0;
        let mut cursor = self.queue.peek_first();
        while let Some(event) = cursor {
            cursor = self.queue.next_event(event);
            if self.queue.get(event).and_then(|e| e.mote()) == Some(id) {
                self.queue.release(event);
                swept += 1;
            }
        }
        if let Some(tick) = mote.tick_event() {
            self.queue.release(tick);
        }
        if let Some((event, Some(owner))) = self.executing {
            if owner == id {
                self.queue.release(event);
            }
        }
        mote.set_tick_event(None);

        self.observers.notify(SimulationEvent::MoteRemoved(id));
        debug!(mote = %id, swept, "Mote removed");
        Ok(mote)
    }

    pub fn mote(&self, id: MoteId) -> Option<&Mote> {
        self.motes.iter().find(|m| m.id() == id)
    }

    pub fn mote_mut(&mut self, id: MoteId) -> Option<&mut Mote> {
        self.motes.iter_mut().find(|m| m.id() == id)
    }

    /// Motes in insertion order.
    pub fn motes(&self) -> &[Mote] {
        &self.motes
    }

    pub fn mote_count(&self) -> usize {
        self.motes.len()
    }

    pub fn max_mote_startup_delay(&self) -> SimTime {
        self.config.max_mote_startup_delay
    }

    pub fn set_max_mote_startup_delay(&mut self, delay: SimTime) {
        self.config.max_mote_startup_delay = delay;
    }

    // ========================================================================
    // MOTE TYPES
    // ========================================================================

    pub fn mote_types(&self) -> &[Arc<MoteType>] {
        &self.mote_types
    }

    pub fn mote_type(&self, identifier: &str) -> Option<&Arc<MoteType>> {
        self.mote_types.iter().find(|t| t.identifier() == identifier)
    }

    /// Records a mote type. Returns `false` if one with the same
    /// identifier is already known.
    pub fn add_mote_type(&mut self, mote_type: Arc<MoteType>) -> bool {
        if self.mote_type(mote_type.identifier()).is_some() {
            return false;
        }
        self.mote_types.push(mote_type);
        true
    }

    /// Forgets a mote type and removes all of its motes.
    pub fn remove_mote_type(&mut self, identifier: &str) -> SimResult<Vec<Mote>> {
        if self.mote_type(identifier).is_none() {
            return Err(ConfigError::UnknownMoteType(identifier.to_string()).into());
        }

        let doomed: Vec<MoteId> = self
            .motes
            .iter()
            .filter(|m| m.mote_type().identifier() == identifier)
            .map(Mote::id)
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            removed.push(self.remove_mote(id)?);
        }

        self.mote_types.retain(|t| t.identifier() != identifier);
        Ok(removed)
    }

    // ========================================================================
    // RADIO MEDIUM
    // ========================================================================

    pub fn radio_medium(&self) -> &dyn RadioMedium {
        self.radio.as_ref()
    }

    pub fn radio_medium_mut(&mut self) -> &mut dyn RadioMedium {
        self.radio.as_mut()
    }

    /// Replaces the radio medium, moving every mote over. Returns the old one.
    pub fn set_radio_medium(&mut self, mut medium: Box<dyn RadioMedium>) -> SimResult<Box<dyn RadioMedium>> {
        for mote in &self.motes {
            medium.register_mote(mote.id())?;
        }
        for mote in &self.motes {
            if let Err(e) = self.radio.unregister_mote(mote.id()) {
                warn!(mote = %mote.id(), "Old radio medium refused unregistration: {}", e);
            }
        }

        let old = std::mem::replace(&mut self.radio, medium);
        let name = self.radio.name().to_string();
        debug!(old = old.name(), new = %name, "Radio medium changed");
        self.observers.notify(SimulationEvent::RadioMediumChanged(name));
        Ok(old)
    }

    // ========================================================================
    // SPEED LIMIT
    // ========================================================================

    pub fn speed_limit(&self) -> Option<f64> {
        self.speed_limit
    }

    /// Sets the simulated/real time ratio cap; `None` runs at full speed.
    pub fn set_speed_limit(&mut self, limit: Option<f64>) -> Result<(), ConfigError> {
        validate_speed_limit(limit)?;
        self.speed_limit = limit;
        self.speed_anchor = None;

        if limit.is_some() && !self.queue.is_scheduled(self.delay_event) {
            if let Err(e) = self.queue.add_event(self.delay_event, self.current_time) {
                warn!("Cannot schedule speed limiter: {}", e);
            }
        }
        debug!(?limit, "Speed limit changed");
        Ok(())
    }

    // ========================================================================
    // MILLISECOND OBSERVERS
    // ========================================================================

    /// Installs a callback fired once per simulated millisecond.
    pub fn add_millisecond_observer(&mut self, observer: MillisecondObserver) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.ms_observers.push((id, observer));

        if !self.queue.is_scheduled(self.ms_event) {
            if let Err(e) = self.queue.add_event(self.ms_event, self.current_time) {
                warn!("Cannot schedule millisecond observers: {}", e);
            }
        }
        id
    }

    pub fn remove_millisecond_observer(&mut self, id: ObserverId) -> bool {
        let before = self.ms_observers.len();
        self.ms_observers.retain(|(observer, _)| *observer != id);
        self.ms_observers.len() != before
    }

    /// Fires every millisecond observer. Returns `false` if there are none.
    pub(crate) fn notify_millisecond_observers(&mut self, time: SimTime) -> bool {
        for (_, observer) in self.ms_observers.iter_mut() {
            observer(time, &self.motes);
        }
        !self.ms_observers.is_empty()
    }

    // ========================================================================
    // RANDOMNESS
    // ========================================================================

    /// The kernel's seeded generator.
    pub fn random(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// Reseeds the generator.
    pub fn set_random_seed(&mut self, seed: u64) {
        self.random_seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// True if the seed was drawn from the wall clock.
    pub fn random_seed_generated(&self) -> bool {
        self.random_seed_generated
    }

    // ========================================================================
    // EVENT CENTRAL
    // ========================================================================

    pub fn event_central(&self) -> &SimEventCentral {
        &self.events
    }

    pub fn add_mote_count_listener(&mut self, listener: Box<dyn MoteCountListener>) -> ListenerId {
        self.events.add_mote_count_listener(listener)
    }

    pub fn remove_mote_count_listener(&mut self, id: ListenerId) -> bool {
        self.events.remove_mote_count_listener(id)
    }

    pub fn add_log_output_listener(&mut self, listener: Box<dyn LogOutputListener>) -> ListenerId {
        self.events.add_log_output_listener(listener, &mut self.motes)
    }

    pub fn remove_log_output_listener(&mut self, id: ListenerId) -> bool {
        self.events.remove_log_output_listener(id, &mut self.motes)
    }

    /// Log output history, oldest first.
    pub fn log_output_history(&self) -> Vec<LogOutputEvent> {
        self.events.log_output_history()
    }

    pub fn set_log_output_buffer_size(&mut self, size: usize) -> Result<(), ConfigError> {
        self.events.set_log_output_buffer_size(size)?;
        self.config.log_output_buffer_size = size;
        Ok(())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("time", &self.current_time)
            .field("motes", &self.motes.len())
            .field("pending_events", &self.queue.len())
            .field("radio", &self.radio.name())
            .field("speed_limit", &self.speed_limit)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic".to_string()
    }
}
