//! Schedulable events.
//!
//! Events are registered with the kernel once and may then be scheduled,
//! executed and rescheduled any number of times. An event that wants to run
//! periodically reschedules itself from inside `execute`, using the handle
//! it is given.

use super::kernel::Kernel;
use crate::error::{SimError, SimResult};
use crate::event_queue::EventId;
use motesim_env::{CpuFault, MoteId, SimTime, MILLISECOND};
use std::thread;
use std::time::{Duration, Instant};

/// Unit of schedulable work.
pub trait TimeEvent: Send {
    /// Runs the event at `time`, which is now the kernel's current time.
    ///
    /// `this` is the event's own handle, for rescheduling.
    fn execute(&mut self, kernel: &mut Kernel, this: EventId, time: SimTime) -> SimResult<()>;

    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Mote this event belongs to. Such events are swept when the mote
    /// is removed.
    fn mote(&self) -> Option<MoteId> {
        None
    }
}

/// Event backed by a closure.
pub struct FnEvent<F> {
    name: String,
    mote: Option<MoteId>,
    f: F,
}

impl<F> FnEvent<F>
where
    F: FnMut(&mut Kernel, EventId, SimTime) -> SimResult<()> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            mote: None,
            f,
        }
    }

    /// Ties the event to a mote.
    pub fn for_mote(mut self, mote: MoteId) -> Self {
        self.mote = Some(mote);
        self
    }
}

impl<F> TimeEvent for FnEvent<F>
where
    F: FnMut(&mut Kernel, EventId, SimTime) -> SimResult<()> + Send + 'static,
{
    fn execute(&mut self, kernel: &mut Kernel, this: EventId, time: SimTime) -> SimResult<()> {
        (self.f)(kernel, this, time)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mote(&self) -> Option<MoteId> {
        self.mote
    }
}

/// Drives one mote: ticks it and reschedules at the mote's next wakeup.
pub(crate) struct MoteTickEvent {
    mote: MoteId,
}

impl MoteTickEvent {
    pub(crate) fn new(mote: MoteId) -> Self {
        Self { mote }
    }
}

impl TimeEvent for MoteTickEvent {
    fn execute(&mut self, kernel: &mut Kernel, this: EventId, time: SimTime) -> SimResult<()> {
        let mote = kernel.mote_mut(self.mote).ok_or(SimError::UnknownMote(self.mote))?;
        let outcome = mote.tick(time);
        if let Some(next) = mote.next_tick() {
            kernel.schedule(this, next)?;
        }

        match outcome {
            Ok(_) => Ok(()),
            Err(CpuFault::StopRequested { reason }) => Err(SimError::StopRequested {
                mote: Some(self.mote),
                reason,
            }),
            Err(source) => Err(SimError::MoteFault {
                mote: self.mote,
                event: self.name().to_string(),
                source,
            }),
        }
    }

    fn name(&self) -> &str {
        "mote tick"
    }

    fn mote(&self) -> Option<MoteId> {
        Some(self.mote)
    }
}

/// Speed limiter anchor: real instant and simulated time it corresponds to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpeedAnchor {
    real: Instant,
    sim: SimTime,
}

impl SpeedAnchor {
    pub(crate) fn now(sim: SimTime) -> Self {
        Self {
            real: Instant::now(),
            sim,
        }
    }
}

/// Lag behind the limit after which the limiter re-anchors.
const STALL_WINDOW: Duration = Duration::from_secs(1);

/// Caps the simulated/real time ratio. Runs every simulated millisecond
/// while a limit is set and goes idle otherwise.
pub(crate) struct DelayEvent;

impl TimeEvent for DelayEvent {
    fn execute(&mut self, kernel: &mut Kernel, this: EventId, time: SimTime) -> SimResult<()> {
        let Some(limit) = kernel.speed_limit() else {
            kernel.speed_anchor = None;
            return Ok(());
        };

        match kernel.speed_anchor {
            None => kernel.speed_anchor = Some(SpeedAnchor::now(time)),
            Some(anchor) => {
                let sim_ms = time.saturating_sub(anchor.sim) as f64 / MILLISECOND as f64;
                let expected = Duration::from_secs_f64(sim_ms / limit / 1000.0);
                let elapsed = anchor.real.elapsed();
                if expected > elapsed {
                    thread::sleep(expected - elapsed);
                } else if elapsed > expected + STALL_WINDOW {
                    // Stalled: start over rather than catch up
                    kernel.speed_anchor = Some(SpeedAnchor::now(time));
                }
            }
        }

        kernel.schedule(this, time + MILLISECOND)
    }

    fn name(&self) -> &str {
        "speed limit"
    }
}

/// Fans out to millisecond observers. Scheduled only while any exist.
pub(crate) struct MillisecondEvent;

impl TimeEvent for MillisecondEvent {
    fn execute(&mut self, kernel: &mut Kernel, this: EventId, time: SimTime) -> SimResult<()> {
        if !kernel.notify_millisecond_observers(time) {
            return Ok(());
        }
        kernel.schedule(this, time + MILLISECOND)
    }

    fn name(&self) -> &str {
        "millisecond observers"
    }
}

/// One-shot: asks the run loop to stop after this event, then releases
/// itself.
pub(crate) struct StopEvent;

impl TimeEvent for StopEvent {
    fn execute(&mut self, kernel: &mut Kernel, this: EventId, _time: SimTime) -> SimResult<()> {
        kernel.request_stop();
        kernel.release_event(this);
        Ok(())
    }

    fn name(&self) -> &str {
        "stop"
    }
}
