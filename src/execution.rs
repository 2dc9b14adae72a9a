use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::surface::{Affinity, GlBackend, Handoff, Lease, RenderSurface, RenderTarget};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running,
    SteppingRequested,
    Stopping,
    Terminated,
}

impl ExecutionState {
    /// The worker exists and may hold the context.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ExecutionState::Running | ExecutionState::SteppingRequested | ExecutionState::Stopping
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ExecutionState::Running,
            2 => ExecutionState::SteppingRequested,
            3 => ExecutionState::Stopping,
            4 => ExecutionState::Terminated,
            _ => ExecutionState::Idle,
        }
    }
}

/// The emulated system, driven from the execution thread.
pub trait EmulationCore: Send + 'static {
    /// Runs one host-to-emulated-time slice.
    ///
    /// Long slices should return early once `interrupt.quit_requested()` turns true.
    fn run_iteration(&mut self, target: &mut dyn RenderTarget, interrupt: &Interrupt);

    /// Executes exactly one unit of emulated work.
    fn single_step(&mut self, target: &mut dyn RenderTarget);

    /// Halts emulation and releases core resources. Called once per worker, after the
    /// context went back to the controller.
    fn halt_and_release(&mut self);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Started,
    Stepped,
    Stopped,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopDiagnostic {
    /// `stop` was called while no worker was running.
    NotRunning,
    /// The worker outlived grace interval `tier`.
    StopTimeout { tier: u8 },
    QuitRequested,
    /// The worker was abandoned. Context and core state may be inconsistent.
    ForcedTerminationUsed,
    WorkerPanicked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub diagnostics: Vec<StopDiagnostic>,
}

impl StopReport {
    pub fn count(&self, diagnostic: StopDiagnostic) -> usize {
        self.diagnostics.iter().filter(|d| **d == diagnostic).count()
    }

    pub fn forced(&self) -> bool {
        self.count(StopDiagnostic::ForcedTerminationUsed) > 0
    }

    /// The worker exited within the first grace interval.
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    fn push(&mut self, diagnostic: StopDiagnostic) {
        self.diagnostics.push(diagnostic);
    }
}

/// How long `stop` waits before each escalation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StopPolicy {
    pub grace: Duration,
    pub quit_grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(500),
            quit_grace: Duration::from_millis(1000),
        }
    }
}

struct Control {
    state: AtomicU8,
    stop: AtomicBool,
    quit: AtomicBool,
    cpu_running: AtomicBool,
    pending_steps: AtomicUsize,
    iterations: AtomicU64,
    steps: AtomicU64,
}

impl Control {
    fn new(cpu_running: bool) -> Self {
        Self {
            state: AtomicU8::new(ExecutionState::Idle as u8),
            stop: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            cpu_running: AtomicBool::new(cpu_running),
            pending_steps: AtomicUsize::new(0),
            iterations: AtomicU64::new(0),
            steps: AtomicU64::new(0),
        }
    }

    fn state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ExecutionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ExecutionState, to: ExecutionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_pending_step(&self) -> bool {
        self.pending_steps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Leaves SteppingRequested once no step is queued. Runs after every loop pass, so a
    /// request racing the worker's last step is settled on the next pass.
    fn settle(&self) {
        if self.pending_steps.load(Ordering::Acquire) == 0
            && self.transition(ExecutionState::SteppingRequested, ExecutionState::Running)
            && self.pending_steps.load(Ordering::Acquire) > 0
        {
            self.transition(ExecutionState::Running, ExecutionState::SteppingRequested);
        }
    }
}

/// Cooperative signals visible to the emulation core.
pub struct Interrupt {
    control: Arc<Control>,
}

impl Interrupt {
    pub fn stop_requested(&self) -> bool {
        self.control.stop.load(Ordering::Acquire)
    }

    /// Second tier of the stop protocol: the core should abandon its slice now.
    pub fn quit_requested(&self) -> bool {
        self.control.quit.load(Ordering::Acquire)
    }
}

struct WorkerExit<C, B: GlBackend> {
    core: C,
    handoff: Option<Handoff<B>>,
}

struct Worker<C, B: GlBackend> {
    handle: JoinHandle<WorkerExit<C, B>>,
    exited: Receiver<()>,
    lease: Lease<B>,
}

/// Owns the emulation worker and its run / step / stop state machine.
pub struct ExecutionThread<C: EmulationCore, B: GlBackend> {
    control: Arc<Control>,
    policy: StopPolicy,
    core: Option<C>,
    worker: Option<Worker<C, B>>,
    // Each worker gets its own sender, so an abandoned one can't post into a later run.
    events_rx: Receiver<ExecutionEvent>,
}

impl<C: EmulationCore, B: GlBackend> ExecutionThread<C, B> {
    pub fn new(core: C, policy: StopPolicy) -> Self {
        let (_, events_rx) = mpsc::channel();
        Self {
            control: Arc::new(Control::new(true)),
            policy,
            core: Some(core),
            worker: None,
            events_rx,
        }
    }

    /// Replaces the event channel, carrying over unread events.
    fn reopen_events(&mut self) -> Sender<ExecutionEvent> {
        let (events_tx, events_rx) = mpsc::channel();
        for event in self.events_rx.try_iter() {
            let _ = events_tx.send(event);
        }
        self.events_rx = events_rx;
        events_tx
    }

    /// Posts the `Stopped` a worker that died or was abandoned never sent.
    fn post_stopped(&mut self) {
        let events = self.reopen_events();
        let _ = events.send(ExecutionEvent::Stopped);
    }

    pub fn state(&self) -> ExecutionState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn policy(&self) -> StopPolicy {
        self.policy
    }

    /// Completed `run_iteration` calls of the current worker.
    pub fn iterations(&self) -> u64 {
        self.control.iterations.load(Ordering::Acquire)
    }

    /// Completed `single_step` calls of the current worker.
    pub fn steps(&self) -> u64 {
        self.control.steps.load(Ordering::Acquire)
    }

    /// Worker notifications, in the order they were sent.
    pub fn events(&self) -> &Receiver<ExecutionEvent> {
        &self.events_rx
    }

    pub fn poll_event(&self) -> Option<ExecutionEvent> {
        self.events_rx.try_recv().ok()
    }

    pub fn set_cpu_running(&self, running: bool) {
        self.control.cpu_running.store(running, Ordering::Release);
    }

    pub fn is_cpu_running(&self) -> bool {
        self.control.cpu_running.load(Ordering::Acquire)
    }

    /// Hands the context to a new worker and starts the loop.
    pub fn start(&mut self, surface: &mut RenderSurface<B>) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let core = self.core.take().ok_or(Error::CoreUnavailable)?;
        let handoff = match surface.transfer_affinity(Affinity::Execution) {
            Ok(handoff) => handoff,
            Err(e) => {
                self.core = Some(core);
                return Err(e);
            }
        };
        self.control.stop.store(false, Ordering::Release);
        self.control.quit.store(false, Ordering::Release);
        self.control.pending_steps.store(0, Ordering::Release);
        self.control.iterations.store(0, Ordering::Release);
        self.control.steps.store(0, Ordering::Release);
        self.control.set_state(ExecutionState::Running);

        let (exited_tx, exited) = mpsc::channel();
        let control = self.control.clone();
        let events = self.reopen_events();
        let lease = handoff.lease();
        let spawned = thread::Builder::new()
            .name("emu-thread".to_owned())
            .spawn(move || run_worker(core, handoff, control, events, exited_tx));
        match spawned {
            Ok(handle) => {
                info!(target: "execution", "Execution thread started");
                self.worker = Some(Worker {
                    handle,
                    exited,
                    lease,
                });
                Ok(())
            }
            Err(e) => {
                error!(target: "execution", "Failed to spawn execution thread: {}", e);
                surface.reclaim_forcibly();
                self.control.set_state(ExecutionState::Idle);
                Err(Error::Io(e))
            }
        }
    }

    /// Queues one single step. Honored between iterations only.
    pub fn step(&self) -> bool {
        if self.worker.is_none() {
            debug!(target: "execution", "Step requested while execution thread isn't running");
            return false;
        }
        match self.control.state() {
            ExecutionState::Running | ExecutionState::SteppingRequested => {
                // Count first: the worker only leaves SteppingRequested with nothing queued.
                self.control.pending_steps.fetch_add(1, Ordering::AcqRel);
                self.control
                    .transition(ExecutionState::Running, ExecutionState::SteppingRequested);
                true
            }
            _ => false,
        }
    }

    /// Stops the worker and takes the context back, escalating if the worker doesn't
    /// exit in time. Never fails: problems end up in the report and the log.
    pub fn stop(&mut self, surface: &mut RenderSurface<B>) -> StopReport {
        let mut report = StopReport::default();
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                info!(target: "execution", "Stop called while execution thread wasn't running");
                report.push(StopDiagnostic::NotRunning);
                return report;
            }
        };
        if !self
            .control
            .transition(ExecutionState::Running, ExecutionState::Stopping)
        {
            self.control
                .transition(ExecutionState::SteppingRequested, ExecutionState::Stopping);
        }
        self.control.stop.store(true, Ordering::Release);

        if worker.exited.recv_timeout(self.policy.grace) == Err(RecvTimeoutError::Timeout) {
            info!(
                target: "execution",
                "Execution thread still running after {:?}, requesting quit", self.policy.grace
            );
            report.push(StopDiagnostic::StopTimeout { tier: 1 });
            self.control.quit.store(true, Ordering::Release);
            worker.handle.thread().unpark();
            report.push(StopDiagnostic::QuitRequested);

            if worker.exited.recv_timeout(self.policy.quit_grace) == Err(RecvTimeoutError::Timeout) {
                warn!(
                    target: "execution",
                    "Execution thread STILL running after {:?}, something is wrong here",
                    self.policy.quit_grace
                );
                report.push(StopDiagnostic::StopTimeout { tier: 2 });
                self.abandon(worker, surface, &mut report);
                return report;
            }
        }

        self.join(worker, surface, &mut report);
        report
    }

    fn join(
        &mut self,
        worker: Worker<C, B>,
        surface: &mut RenderSurface<B>,
        report: &mut StopReport,
    ) {
        match worker.handle.join() {
            Ok(exit) => {
                self.core = Some(exit.core);
                let accepted = match exit.handoff {
                    Some(handoff) => surface.accept(handoff),
                    None => Err(Error::Driver("context was not handed back".to_string())),
                };
                if let Err(e) = accepted {
                    error!(target: "execution", "Failed to take context back: {}", e);
                    surface.reclaim_forcibly();
                }
            }
            Err(_) => {
                error!(target: "execution", "Execution thread panicked");
                report.push(StopDiagnostic::WorkerPanicked);
                surface.reclaim_forcibly();
                self.post_stopped();
            }
        }
        self.control.set_state(ExecutionState::Terminated);
        info!(target: "execution", "Execution thread stopped");
    }

    /// Last resort: detaches the worker and takes the context without its cooperation.
    /// The core goes down with the worker.
    fn abandon(
        &mut self,
        worker: Worker<C, B>,
        surface: &mut RenderSurface<B>,
        report: &mut StopReport,
    ) {
        drop(worker);
        surface.reclaim_forcibly();
        let cpu_running = self.is_cpu_running();
        self.control = Arc::new(Control::new(cpu_running));
        self.control.set_state(ExecutionState::Terminated);
        self.post_stopped();
        report.push(StopDiagnostic::ForcedTerminationUsed);
        warn!(
            target: "execution",
            "Execution thread abandoned, context and emulation state may be inconsistent"
        );
    }
}

/// Without a surface to hand the context to, a dropped thread leaves it for the
/// controller to adopt: a worker that exits drops its hand-off, and one that doesn't
/// has its lease revoked.
impl<C: EmulationCore, B: GlBackend> Drop for ExecutionThread<C, B> {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        warn!(target: "execution", "Execution thread dropped while running");
        self.control.stop.store(true, Ordering::Release);
        self.control.quit.store(true, Ordering::Release);
        worker.handle.thread().unpark();
        let wait = self.policy.grace + self.policy.quit_grace;
        if worker.exited.recv_timeout(wait) == Err(RecvTimeoutError::Timeout) {
            worker.lease.revoke();
            warn!(target: "execution", "Execution thread abandoned on drop");
            return;
        }
        if worker.handle.join().is_err() {
            error!(target: "execution", "Execution thread panicked");
            worker.lease.revoke();
        }
    }
}

fn run_worker<C: EmulationCore, B: GlBackend>(
    mut core: C,
    handoff: Handoff<B>,
    control: Arc<Control>,
    events: Sender<ExecutionEvent>,
    exited: Sender<()>,
) -> WorkerExit<C, B> {
    let mut token = match handoff.accept() {
        Ok(token) => token,
        Err(e) => {
            error!(target: "execution", "Execution thread could not take the context: {}", e);
            core.halt_and_release();
            control.set_state(ExecutionState::Terminated);
            let _ = exited.send(());
            return WorkerExit {
                core,
                handoff: None,
            };
        }
    };
    let _ = events.send(ExecutionEvent::Started);
    let interrupt = Interrupt {
        control: control.clone(),
    };

    while !control.stop.load(Ordering::Acquire) {
        if control.take_pending_step() {
            core.single_step(&mut token);
            control.steps.fetch_add(1, Ordering::AcqRel);
            let _ = events.send(ExecutionEvent::Stepped);
            thread::yield_now();
        } else if control.cpu_running.load(Ordering::Acquire) {
            core.run_iteration(&mut token, &interrupt);
            control.iterations.fetch_add(1, Ordering::AcqRel);
        } else {
            thread::yield_now();
        }
        control.settle();
    }

    let handoff = if token.is_revoked() {
        warn!(target: "execution", "Context was reclaimed while the execution thread was away");
        None
    } else {
        match token.transfer(Affinity::Controller) {
            Ok(handoff) => Some(handoff),
            Err(e) => {
                error!(target: "execution", "Failed to hand the context back: {}", e);
                None
            }
        }
    };
    core.halt_and_release();
    control.set_state(ExecutionState::Terminated);
    let _ = events.send(ExecutionEvent::Stopped);
    let _ = exited.send(());
    WorkerExit { core, handoff }
}
