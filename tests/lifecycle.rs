use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use emuhost::headless::{HeadlessBackend, HeadlessFactory};
use emuhost::{
    Affinity, ContextFactory, ContextProfile, EmulationCore, Error, ExecutionEvent,
    ExecutionState, ExecutionThread, GlBackend, Interrupt, RenderSurface, RenderTarget,
    StopDiagnostic, StopPolicy,
};
use proptest::prelude::*;

#[derive(Clone, Default)]
struct Counters {
    iterations: Arc<AtomicU64>,
    steps: Arc<AtomicU64>,
    halts: Arc<AtomicU64>,
}

/// Renders one frame per iteration and honors the stop flag between iterations.
struct FrameCore {
    counters: Counters,
}

impl EmulationCore for FrameCore {
    fn run_iteration(&mut self, target: &mut dyn RenderTarget, _interrupt: &Interrupt) {
        target.make_current().unwrap();
        target.swap_buffers().unwrap();
        self.counters.iterations.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
    }

    fn single_step(&mut self, target: &mut dyn RenderTarget) {
        target.make_current().unwrap();
        self.counters.steps.fetch_add(1, Ordering::SeqCst);
    }

    fn halt_and_release(&mut self) {
        self.counters.halts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Ignores the stop flag, leaves its slice once quit is requested.
struct SlowCore;

impl EmulationCore for SlowCore {
    fn run_iteration(&mut self, _target: &mut dyn RenderTarget, interrupt: &Interrupt) {
        while !interrupt.quit_requested() {
            thread::park_timeout(Duration::from_millis(5));
        }
    }

    fn single_step(&mut self, _target: &mut dyn RenderTarget) {}

    fn halt_and_release(&mut self) {}
}

type Gate = Arc<(Mutex<bool>, Condvar)>;

/// Blocks inside its first iteration until the gate opens, whatever the signals say.
struct WedgedCore {
    gate: Gate,
    entered: Sender<()>,
    halted: Sender<()>,
}

impl EmulationCore for WedgedCore {
    fn run_iteration(&mut self, target: &mut dyn RenderTarget, _interrupt: &Interrupt) {
        target.make_current().unwrap();
        let _ = self.entered.send(());
        let (open, cvar) = &*self.gate;
        let mut open = open.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }

    fn single_step(&mut self, _target: &mut dyn RenderTarget) {}

    fn halt_and_release(&mut self) {
        let _ = self.halted.send(());
    }
}

/// A driver whose buffer swap never returns.
struct HangingBackend {
    swapping: Sender<()>,
}

impl GlBackend for HangingBackend {
    fn make_current(&mut self) -> emuhost::Result<()> {
        Ok(())
    }

    fn make_not_current(&mut self) -> emuhost::Result<()> {
        Ok(())
    }

    fn swap_buffers(&mut self) -> emuhost::Result<()> {
        let _ = self.swapping.send(());
        loop {
            thread::park();
        }
    }

    fn logical_size(&self) -> (u32, u32) {
        (64, 64)
    }
}

struct HangingFactory {
    swapping: Sender<()>,
}

impl ContextFactory for HangingFactory {
    type Backend = HangingBackend;

    fn create(&self, _profile: &ContextProfile) -> emuhost::Result<HangingBackend> {
        Ok(HangingBackend {
            swapping: self.swapping.clone(),
        })
    }
}

struct SwapCore;

impl EmulationCore for SwapCore {
    fn run_iteration(&mut self, target: &mut dyn RenderTarget, _interrupt: &Interrupt) {
        if target.make_current().is_ok() {
            let _ = target.swap_buffers();
        }
    }

    fn single_step(&mut self, _target: &mut dyn RenderTarget) {}

    fn halt_and_release(&mut self) {}
}

struct PanickingCore;

impl EmulationCore for PanickingCore {
    fn run_iteration(&mut self, _target: &mut dyn RenderTarget, _interrupt: &Interrupt) {
        panic!("core fault");
    }

    fn single_step(&mut self, _target: &mut dyn RenderTarget) {}

    fn halt_and_release(&mut self) {}
}

fn surface(factory: &HeadlessFactory) -> RenderSurface<HeadlessBackend> {
    RenderSurface::create_context(factory, &ContextProfile::default()).unwrap()
}

fn short_policy() -> StopPolicy {
    StopPolicy {
        grace: Duration::from_millis(50),
        quit_grace: Duration::from_millis(50),
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn drain(events: &Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    events.try_iter().collect()
}

#[test]
fn clean_run_returns_context_to_controller() {
    let factory = HeadlessFactory::new(400, 480);
    let stats = factory.stats();
    let mut surface = surface(&factory);
    let counters = Counters::default();
    let mut execution = ExecutionThread::new(
        FrameCore { counters: counters.clone() },
        StopPolicy::default(),
    );

    execution.start(&mut surface).unwrap();
    assert_eq!(execution.state(), ExecutionState::Running);
    assert_eq!(surface.affinity(), Affinity::Execution);
    assert!(!surface.holds_context());

    wait_until("five iterations", || execution.iterations() >= 5);
    let report = execution.stop(&mut surface);

    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(execution.state(), ExecutionState::Terminated);
    assert_eq!(surface.affinity(), Affinity::Controller);
    assert!(surface.holds_context());
    assert!(!surface.is_current());
    assert_eq!(counters.halts.load(Ordering::SeqCst), 1);
    assert!(stats.swaps() >= 5);
    assert_eq!(stats.conflicts(), 0);

    let events = drain(execution.events());
    assert_eq!(events.first(), Some(&ExecutionEvent::Started));
    assert_eq!(events.last(), Some(&ExecutionEvent::Stopped));

    // The controller can draw again.
    surface.make_current().unwrap();
    surface.swap_buffers().unwrap();
}

#[test]
fn thread_can_be_restarted_after_clean_stop() {
    let factory = HeadlessFactory::new(64, 64);
    let mut surface = surface(&factory);
    let counters = Counters::default();
    let mut execution = ExecutionThread::new(
        FrameCore { counters: counters.clone() },
        StopPolicy::default(),
    );

    for _ in 0..3 {
        execution.start(&mut surface).unwrap();
        wait_until("an iteration", || execution.iterations() >= 1);
        assert!(execution.stop(&mut surface).is_clean());
    }
    assert_eq!(counters.halts.load(Ordering::SeqCst), 3);
    assert_eq!(surface.affinity(), Affinity::Controller);
}

#[test]
fn quit_is_requested_before_anything_is_forced() {
    let factory = HeadlessFactory::new(64, 64);
    let mut surface = surface(&factory);
    let mut execution = ExecutionThread::new(
        SlowCore,
        StopPolicy {
            grace: Duration::from_millis(30),
            quit_grace: Duration::from_secs(5),
        },
    );

    execution.start(&mut surface).unwrap();
    wait_until("the worker to settle", || execution.poll_event().is_some());
    let report = execution.stop(&mut surface);

    assert_eq!(
        report.diagnostics,
        [StopDiagnostic::StopTimeout { tier: 1 }, StopDiagnostic::QuitRequested]
    );
    assert!(!report.forced());
    assert_eq!(execution.state(), ExecutionState::Terminated);
    assert_eq!(surface.affinity(), Affinity::Controller);
    assert!(surface.holds_context());
}

#[test]
fn wedged_worker_is_abandoned_after_both_intervals() {
    let factory = HeadlessFactory::new(64, 64);
    let stats = factory.stats();
    let mut surface = surface(&factory);
    let gate: Gate = Arc::new((Mutex::new(false), Condvar::new()));
    let (entered_tx, entered) = mpsc::channel();
    let (halted_tx, halted) = mpsc::channel();
    let mut execution = ExecutionThread::new(
        WedgedCore {
            gate: gate.clone(),
            entered: entered_tx,
            halted: halted_tx,
        },
        short_policy(),
    );

    execution.start(&mut surface).unwrap();
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let started = Instant::now();
    let report = execution.stop(&mut surface);
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(
        report.diagnostics,
        [
            StopDiagnostic::StopTimeout { tier: 1 },
            StopDiagnostic::QuitRequested,
            StopDiagnostic::StopTimeout { tier: 2 },
            StopDiagnostic::ForcedTerminationUsed,
        ]
    );
    assert_eq!(report.count(StopDiagnostic::ForcedTerminationUsed), 1);
    assert_eq!(execution.state(), ExecutionState::Terminated);
    assert_eq!(surface.affinity(), Affinity::Controller);
    assert!(surface.holds_context());

    let events = drain(execution.events());
    assert_eq!(events.first(), Some(&ExecutionEvent::Started));
    assert_eq!(events.last(), Some(&ExecutionEvent::Stopped));

    // The core went down with the worker.
    assert!(matches!(execution.start(&mut surface), Err(Error::CoreUnavailable)));

    // Let the abandoned worker run out. It must not hand back a revoked context.
    {
        let (open, cvar) = &*gate;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }
    halted.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(surface.affinity(), Affinity::Controller);
    assert_eq!(execution.state(), ExecutionState::Terminated);
    // Its late Stopped goes nowhere.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(execution.poll_event(), None);

    // The driver still has the context bound to the abandoned thread.
    assert!(matches!(surface.make_current(), Err(Error::Driver(_))));
    assert_eq!(stats.conflicts(), 1);
}

#[test]
fn worker_panic_is_reported_and_context_reclaimed() {
    let factory = HeadlessFactory::new(64, 64);
    let mut surface = surface(&factory);
    let mut execution = ExecutionThread::new(PanickingCore, short_policy());

    execution.start(&mut surface).unwrap();
    let report = execution.stop(&mut surface);

    assert_eq!(report.count(StopDiagnostic::WorkerPanicked), 1);
    assert!(!report.forced());
    assert_eq!(execution.state(), ExecutionState::Terminated);
    assert_eq!(surface.affinity(), Affinity::Controller);
    assert_eq!(drain(execution.events()).last(), Some(&ExecutionEvent::Stopped));
    assert!(matches!(execution.start(&mut surface), Err(Error::CoreUnavailable)));
}

#[test]
fn forced_stop_returns_while_the_driver_hangs() {
    let (done_tx, done) = mpsc::channel();
    // The surface stays on this thread; a deadlock shows up as a timeout below.
    thread::spawn(move || {
        let (swapping_tx, swapping) = mpsc::channel();
        let factory = HangingFactory {
            swapping: swapping_tx,
        };
        let mut surface = RenderSurface::create_context(&factory, &ContextProfile::default())
            .unwrap();
        let mut execution = ExecutionThread::new(SwapCore, short_policy());
        execution.start(&mut surface).unwrap();
        swapping.recv_timeout(Duration::from_secs(5)).unwrap();

        let report = execution.stop(&mut surface);
        let _ = done_tx.send((
            report.forced(),
            surface.affinity(),
            surface.holds_context(),
            matches!(surface.make_current(), Err(Error::Driver(_))),
            surface.frame_buffer_size(),
        ));
    });

    let outcome = done.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome, (true, Affinity::Controller, true, true, (64, 64)));
}

#[test]
fn dropping_a_running_thread_returns_the_context() {
    let factory = HeadlessFactory::new(64, 64);
    let stats = factory.stats();
    let mut surface = surface(&factory);
    let mut execution = ExecutionThread::new(
        FrameCore { counters: Counters::default() },
        StopPolicy::default(),
    );
    execution.start(&mut surface).unwrap();
    wait_until("an iteration", || execution.iterations() >= 1);

    drop(execution);

    assert!(surface.holds_context());
    assert_eq!(surface.affinity(), Affinity::Controller);
    surface.make_current().unwrap();
    surface.swap_buffers().unwrap();
    assert_eq!(stats.conflicts(), 0);
}

#[test]
fn dropping_a_wedged_thread_revokes_its_context() {
    let factory = HeadlessFactory::new(64, 64);
    let mut surface = surface(&factory);
    let gate: Gate = Arc::new((Mutex::new(false), Condvar::new()));
    let (entered_tx, entered) = mpsc::channel();
    let (halted_tx, halted) = mpsc::channel();
    let mut execution = ExecutionThread::new(
        WedgedCore {
            gate: gate.clone(),
            entered: entered_tx,
            halted: halted_tx,
        },
        short_policy(),
    );
    execution.start(&mut surface).unwrap();
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    drop(execution);

    assert!(surface.holds_context());
    assert_eq!(surface.affinity(), Affinity::Controller);

    {
        let (open, cvar) = &*gate;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }
    halted.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(surface.affinity(), Affinity::Controller);
}

#[test]
fn steps_match_requests_one_to_one() {
    let factory = HeadlessFactory::new(64, 64);
    let mut surface = surface(&factory);
    let counters = Counters::default();
    let mut execution = ExecutionThread::new(
        FrameCore { counters: counters.clone() },
        StopPolicy::default(),
    );
    execution.set_cpu_running(false);

    execution.start(&mut surface).unwrap();
    for _ in 0..3 {
        assert!(execution.step());
    }
    wait_until("three steps", || execution.steps() == 3);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(execution.steps(), 3);
    assert_eq!(execution.iterations(), 0);
    assert_eq!(execution.state(), ExecutionState::Running);

    assert!(execution.stop(&mut surface).is_clean());
    assert_eq!(counters.steps.load(Ordering::SeqCst), 3);
    assert_eq!(counters.iterations.load(Ordering::SeqCst), 0);

    let stepped = drain(execution.events())
        .into_iter()
        .filter(|e| *e == ExecutionEvent::Stepped)
        .count();
    assert_eq!(stepped, 3);
}

#[test]
fn steps_are_honored_while_the_cpu_runs() {
    let factory = HeadlessFactory::new(64, 64);
    let mut surface = surface(&factory);
    let counters = Counters::default();
    let mut execution = ExecutionThread::new(
        FrameCore { counters: counters.clone() },
        StopPolicy::default(),
    );

    execution.start(&mut surface).unwrap();
    wait_until("two iterations", || execution.iterations() >= 2);
    for _ in 0..3 {
        assert!(execution.step());
    }
    wait_until("three steps", || execution.steps() == 3);
    wait_until("stepping to settle", || execution.state() == ExecutionState::Running);

    let resumed_from = execution.iterations();
    wait_until("iterations to resume", || execution.iterations() > resumed_from);
    assert_eq!(execution.steps(), 3);

    assert!(execution.stop(&mut surface).is_clean());
    assert_eq!(counters.steps.load(Ordering::SeqCst), 3);
    let stepped = drain(execution.events())
        .into_iter()
        .filter(|e| *e == ExecutionEvent::Stepped)
        .count();
    assert_eq!(stepped, 3);
}

#[test]
fn stop_on_idle_thread_changes_nothing() {
    let factory = HeadlessFactory::new(64, 64);
    let mut surface = surface(&factory);
    let mut execution: ExecutionThread<SlowCore, HeadlessBackend> =
        ExecutionThread::new(SlowCore, StopPolicy::default());

    let started = Instant::now();
    let report = execution.stop(&mut surface);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(report.diagnostics, [StopDiagnostic::NotRunning]);
    assert_eq!(execution.state(), ExecutionState::Idle);
    assert!(surface.holds_context());
    assert_eq!(surface.affinity(), Affinity::Controller);
}

#[test]
fn unsupported_profile_fails_construction() {
    let factory = HeadlessFactory::new(64, 64).with_max_version(3, 3);
    let profile = ContextProfile {
        major: 4,
        minor: 5,
        ..Default::default()
    };
    assert!(matches!(
        RenderSurface::create_context(&factory, &profile),
        Err(Error::ContextCreation(_))
    ));
}

#[test]
fn drawable_is_resized_on_next_make_current() {
    let factory = HeadlessFactory::new(64, 64).with_scale(2.0);
    let stats = factory.stats();
    let surface = surface(&factory);

    surface.make_current().unwrap();
    assert_eq!(stats.resizes(), 1);
    surface.make_current().unwrap();
    assert_eq!(stats.resizes(), 1);

    surface.set_client_area(100, 50);
    assert_eq!(surface.frame_buffer_size(), (200, 100));
    surface.make_current().unwrap();
    assert_eq!(stats.resizes(), 2);
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Step,
    Stop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Start), Just(Op::Step), Just(Op::Stop)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn affinity_follows_execution_state(ops in prop::collection::vec(op(), 1..8)) {
        let factory = HeadlessFactory::new(32, 32);
        let mut surface = surface(&factory);
        let mut execution = ExecutionThread::new(
            FrameCore { counters: Counters::default() },
            StopPolicy::default(),
        );

        for op in ops {
            match op {
                Op::Start => {
                    let was_running = execution.is_running();
                    let result = execution.start(&mut surface);
                    prop_assert_eq!(result.is_err(), was_running);
                }
                Op::Step => {
                    execution.step();
                }
                Op::Stop => {
                    prop_assert!(!execution.stop(&mut surface).forced());
                }
            }

            let state = execution.state();
            let expected = if state.is_active() { Affinity::Execution } else { Affinity::Controller };
            prop_assert_eq!(surface.affinity(), expected, "state {:?}", state);
            prop_assert_eq!(surface.holds_context(), !state.is_active());
        }

        execution.stop(&mut surface);
        prop_assert_eq!(surface.affinity(), Affinity::Controller);
    }
}
