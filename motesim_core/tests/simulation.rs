//! Cross-thread kernel behaviour: run loop, poll requests, stopping and
//! fault handling.

mod common;

use common::{mote_with_cpu, simulation, sky_mote, TestCpu};
use crossbeam::channel::bounded;
use motesim_core::{
    FaultPolicy, FnEvent, Kernel, LogOutputEvent, LogOutputListener, SimConfig, SimError, SimulationEvent, TimeEvent,
};
use motesim_env::{CpuFault, MoteId, Platform, SimTime, MILLISECOND};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn periodic(name: &str, period: SimTime, log: Arc<Mutex<Vec<SimTime>>>) -> Box<dyn TimeEvent> {
    Box::new(FnEvent::new(name, move |k: &mut Kernel, this, time| {
        log.lock().unwrap().push(time);
        k.schedule(this, time + period)
    }))
}

#[test]
fn test_time_is_monotonic_across_a_run() {
    let (sim, _) = simulation(SimConfig::default().with_max_startup_delay(700));
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 1..=3 {
        sim.add_mote(sky_mote(i)).unwrap();
    }
    let events = Arc::clone(&log);
    sim.query(move |k| {
        k.schedule_event(periodic("p137", 137, Arc::clone(&events)), 0)?;
        k.schedule_event(periodic("p250", 250, Arc::clone(&events)), 5)?;
        k.schedule_stop(50 * MILLISECOND)
    })
    .unwrap()
    .unwrap();

    sim.start().unwrap();
    let mut last = 0;
    while sim.is_running() {
        let now = sim.time();
        assert!(now >= last, "time went from {} to {}", last, now);
        last = now;
    }
    sim.wait_until_stopped(WAIT).unwrap();

    let times = log.lock().unwrap().clone();
    assert!(times.len() > 300);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(sim.time(), 50 * MILLISECOND);
    assert!(sim.last_fault().is_none());
}

#[test]
fn test_poll_request_runs_before_next_event_without_advancing_time() {
    let (sim, _) = simulation(SimConfig::default());
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (entered_tx, entered_rx) = bounded::<()>(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    sim.query(move |k| {
        k.schedule_event(
            Box::new(FnEvent::new("gate", move |_k: &mut Kernel, _this, _time| {
                let _ = entered_tx.send(());
                let _ = gate_rx.recv();
                Ok(())
            })),
            100,
        )?;
        k.schedule_event(
            Box::new(FnEvent::new("at T", move |k: &mut Kernel, _this, time| {
                o.lock().unwrap().push(format!("event@{}", time));
                k.request_stop();
                Ok(())
            })),
            5000,
        )
    })
    .unwrap()
    .unwrap();

    sim.start().unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    // The gate event is executing at t=100; this request must wait for it
    let o = Arc::clone(&order);
    sim.invoke_simulation_thread(move |k| {
        o.lock().unwrap().push(format!("poll@{}", k.time()));
    });
    assert_eq!(sim.time(), 100);
    gate_tx.send(()).unwrap();

    sim.wait_until_stopped(WAIT).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["poll@100", "event@5000"]);
}

#[test]
fn test_empty_queue_is_fatal() {
    let (sim, _) = simulation(SimConfig::default());
    let events = sim.subscribe();

    sim.start().unwrap();
    sim.wait_until_stopped(WAIT).unwrap();

    let fault = sim.last_fault().expect("run must fail");
    assert!(matches!(*fault, SimError::EmptyQueue { time: 0 }));
    assert_eq!(events.recv_timeout(WAIT).unwrap(), SimulationEvent::Started);
    match events.recv_timeout(WAIT).unwrap() {
        SimulationEvent::Stopped { fault: Some(message) } => assert!(message.contains("No more events")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_stop_and_restart() {
    let (sim, _) = simulation(SimConfig::default().with_speed_limit(Some(50.0)));
    let log = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&log);
    sim.query(move |k| k.schedule_event(periodic("tick", MILLISECOND, events), 0))
        .unwrap()
        .unwrap();

    sim.start().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    sim.stop_simulation(true).unwrap();
    assert!(!sim.is_running());
    let first = sim.time();
    assert!(first > 0);

    sim.start().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    sim.stop_simulation(true).unwrap();
    assert!(sim.time() > first);
    assert!(sim.last_fault().is_none());
}

#[test]
fn test_step_millisecond() {
    let (sim, _) = simulation(SimConfig::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&log);
    sim.query(move |k| k.schedule_event(periodic("p100", 100, events), 0))
        .unwrap()
        .unwrap();

    assert!(sim.step_millisecond().unwrap());
    sim.wait_until_stopped(WAIT).unwrap();
    assert_eq!(sim.time(), MILLISECOND);
    // 0, 100, ..., 900; the event at 1000 was queued behind the stop
    assert_eq!(log.lock().unwrap().len(), 10);

    assert!(sim.step_millisecond().unwrap());
    sim.wait_until_stopped(WAIT).unwrap();
    assert_eq!(sim.time(), 2 * MILLISECOND);
}

#[test]
fn test_query_from_simulation_thread_is_rejected() {
    let (sim, _) = simulation(SimConfig::default());
    let outcome = Arc::new(Mutex::new(None));

    let handle = sim.clone();
    let o = Arc::clone(&outcome);
    sim.query(move |k| {
        k.schedule_event(
            Box::new(FnEvent::new("reentrant", move |k: &mut Kernel, _this, _time| {
                let result = handle.query(|k| k.time());
                *o.lock().unwrap() = Some(matches!(result, Err(SimError::NotOnSimulationThread)));
                k.request_stop();
                Ok(())
            })),
            10,
        )
    })
    .unwrap()
    .unwrap();

    sim.start().unwrap();
    sim.wait_until_stopped(WAIT).unwrap();
    assert_eq!(*outcome.lock().unwrap(), Some(true));
}

#[test]
fn test_requests_accepted_while_running_survive_shutdown() {
    let (sim, _) = simulation(SimConfig::default());
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (entered_tx, entered_rx) = bounded::<()>(1);
    sim.query(move |k| {
        k.schedule_event(
            Box::new(FnEvent::new("gate", move |_k: &mut Kernel, _this, _time| {
                let _ = entered_tx.send(());
                let _ = gate_rx.recv();
                Ok(())
            })),
            0,
        )
    })
    .unwrap()
    .unwrap();

    sim.start().unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    sim.stop_simulation(false).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&ran);
    sim.invoke_simulation_thread(move |_k| r.store(true, Ordering::SeqCst));
    gate_tx.send(()).unwrap();

    sim.wait_until_stopped(WAIT).unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert!(sim.last_fault().is_none());
}

#[test]
fn test_requested_stop_is_quiet() {
    let mut cpu = TestCpu::new(Platform::MicaZ);
    cpu.fail_on_run = Some((3, CpuFault::stop("breakpoint at 0x4a2")));
    let (sim, _) = simulation(SimConfig::default().with_max_startup_delay(0));
    let events = sim.subscribe();
    sim.add_mote(mote_with_cpu(1, cpu)).unwrap();

    sim.start().unwrap();
    sim.wait_until_stopped(WAIT).unwrap();

    assert!(sim.last_fault().is_none());
    // Runs at 0 and 1 ms succeed, the third hits the breakpoint
    assert_eq!(sim.time(), 2 * MILLISECOND);
    let stopped = events
        .try_iter()
        .find(|e| matches!(e, SimulationEvent::Stopped { .. }))
        .unwrap();
    assert_eq!(stopped, SimulationEvent::Stopped { fault: None });
}

#[test]
fn test_mote_fault_reaches_handler_under_exit_policy() {
    let mut cpu = TestCpu::new(Platform::MicaZ);
    cpu.fail_on_run = Some((2, CpuFault::IllegalInstruction { pc: 0x100, opcode: 0xdead }));
    let config = SimConfig::default()
        .with_max_startup_delay(0)
        .with_fault_policy(FaultPolicy::ExitProcess);
    let (sim, _) = simulation(config);

    let (fault_tx, fault_rx) = bounded(1);
    sim.set_fault_handler(move |e| {
        let _ = fault_tx.send((e.mote(), e.to_string()));
    });
    sim.add_mote(mote_with_cpu(4, cpu)).unwrap();
    sim.start().unwrap();

    let (mote, message) = fault_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(mote, Some(MoteId(4)));
    assert!(message.contains("Illegal instruction"));

    sim.wait_until_stopped(WAIT).unwrap();
    let fault = sim.last_fault().unwrap();
    assert!(matches!(*fault, SimError::MoteFault { mote: MoteId(4), .. }));

    // Fault left the mote's retry tick queued: a restart resumes the mote
    sim.clear_last_fault();
    let pending = sim.query(|k| k.pending_events()).unwrap();
    assert_eq!(pending, 1);
}

#[test]
fn test_fault_handler_may_replace_itself() {
    let mut cpu = TestCpu::new(Platform::MicaZ);
    cpu.fail_on_run = Some((2, CpuFault::IllegalInstruction { pc: 0x100, opcode: 0xdead }));
    let config = SimConfig::default()
        .with_max_startup_delay(0)
        .with_fault_policy(FaultPolicy::ExitProcess);
    let (sim, _) = simulation(config);

    let (done_tx, done_rx) = bounded(1);
    let handle = Arc::new(Mutex::new(Some(sim.clone())));
    sim.set_fault_handler(move |_e| {
        if let Some(sim) = handle.lock().unwrap().take() {
            sim.set_fault_handler(|_e| {});
        }
        let _ = done_tx.send(());
    });
    sim.add_mote(mote_with_cpu(1, cpu)).unwrap();
    sim.start().unwrap();

    done_rx.recv_timeout(WAIT).unwrap();
    sim.wait_until_stopped(WAIT).unwrap();
    assert!(sim.last_fault().is_some());
}

struct Collect(Arc<Mutex<Vec<LogOutputEvent>>>);

impl LogOutputListener for Collect {
    fn new_log_output(&mut self, event: &LogOutputEvent) {
        self.0.lock().unwrap().push(event.clone());
    }

    fn removed_log_output(&mut self, _event: &LogOutputEvent) {}
}

#[test]
fn test_log_output_history_while_running() {
    let (sim, _) = simulation(SimConfig::default().with_max_startup_delay(0).with_log_buffer_size(8));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = Collect(Arc::clone(&seen));

    sim.add_mote(sky_mote(1)).unwrap();
    sim.query(move |k| {
        k.add_log_output_listener(Box::new(listener));
        k.schedule_stop(20 * MILLISECOND)
    })
    .unwrap()
    .unwrap();

    sim.start().unwrap();
    sim.wait_until_stopped(WAIT).unwrap();

    let history = sim.log_output_history().unwrap();
    assert_eq!(history.len(), 8);
    assert!(history.iter().all(|e| e.mote == MoteId(1) && e.message.starts_with("run ")));
    assert!(history.windows(2).all(|w| w[0].time <= w[1].time));
    assert!(seen.lock().unwrap().len() > 8);
    assert_eq!(seen.lock().unwrap().last(), history.last());
}

#[test]
fn test_invalid_speed_limit_rejected_before_queueing() {
    let (sim, _) = simulation(SimConfig::default());
    assert!(sim.set_speed_limit(Some(0.0)).is_err());
    assert!(sim.set_log_output_buffer_size(0).is_err());
    assert_eq!(sim.query(|k| k.speed_limit()).unwrap(), None);

    sim.set_speed_limit(Some(2.0)).unwrap();
    assert_eq!(sim.query(|k| k.speed_limit()).unwrap(), Some(2.0));
}
