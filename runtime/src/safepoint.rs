use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    Fault, FaultChannel, FaultKind, RuntimeThread, SafepointError,
    SenseBarrier, ThreadManager, ThreadState,
};

const COORDINATOR_RETRY: Duration = Duration::from_millis(1);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafepointStatus {
    Idle = 0,
    Requested = 1,
    /// Terminal: set after a fatal fault, never cleared.
    ShutDown = 2,
}

/// Global poll token and thread registry in one word:
/// `status:2 | generation:30 | live_threads:32`.
///
/// `Idle` means the token is valid and `poll` returns after one load.
#[derive(Debug)]
pub struct SafepointState(AtomicU64);

impl SafepointState {
    const STATUS_MASK: u64 = 0b11;
    const GEN_SHIFT: u32 = 2;
    const GEN_MASK: u64 = (1u64 << 30) - 1;
    const THREADS_SHIFT: u32 = 32;

    #[inline(always)]
    fn pack(status: SafepointStatus, generation: u32, threads: u32) -> u64 {
        debug_assert!((generation as u64) <= Self::GEN_MASK);
        (status as u64)
            | ((generation as u64) << Self::GEN_SHIFT)
            | ((threads as u64) << Self::THREADS_SHIFT)
    }

    #[inline(always)]
    fn unpack(word: u64) -> (SafepointStatus, u32, u32) {
        let status = match word & Self::STATUS_MASK {
            0 => SafepointStatus::Idle,
            1 => SafepointStatus::Requested,
            _ => SafepointStatus::ShutDown,
        };
        let generation = ((word >> Self::GEN_SHIFT) & Self::GEN_MASK) as u32;
        let threads = (word >> Self::THREADS_SHIFT) as u32;
        (status, generation, threads)
    }

    pub fn new() -> Self {
        Self(AtomicU64::new(Self::pack(SafepointStatus::Idle, 0, 0)))
    }

    #[inline(always)]
    pub fn load(&self, ord: Ordering) -> (SafepointStatus, u32, u32, u64) {
        let w = self.0.load(ord);
        let (s, g, t) = Self::unpack(w);
        (s, g, t, w)
    }

    #[inline(always)]
    fn is_idle(&self) -> bool {
        self.0.load(Ordering::Acquire) & Self::STATUS_MASK == 0
    }

    fn update(&self, f: impl Fn(SafepointStatus, u32, u32) -> Option<u64>) -> bool {
        loop {
            let (status, generation, threads, cur) =
                self.load(Ordering::Acquire);
            let Some(next) = f(status, generation, threads) else {
                return false;
            };
            if self
                .0
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Caller holds the coordinator lock, so no request is in flight.
    fn register_thread(&self) {
        self.update(|status, generation, threads| {
            debug_assert_ne!(status, SafepointStatus::Requested);
            let threads = threads.checked_add(1)?;
            Some(Self::pack(status, generation, threads))
        });
    }

    /// Fails while a request is in flight; the caller must join it first.
    fn try_deregister_thread(&self) -> bool {
        self.update(|status, generation, threads| {
            if status == SafepointStatus::Requested {
                return None;
            }
            debug_assert!(threads > 0, "thread count underflow");
            Some(Self::pack(status, generation, threads.saturating_sub(1)))
        })
    }

    /// Invalidates the token. Returns (generation, live threads), or `None`
    /// once shut down.
    fn request(&self) -> Option<(u32, u32)> {
        loop {
            let (status, generation, threads, cur) =
                self.load(Ordering::Acquire);
            match status {
                SafepointStatus::Idle => {}
                SafepointStatus::Requested => {
                    std::hint::spin_loop();
                    continue;
                }
                SafepointStatus::ShutDown => return None,
            }
            let next = Self::pack(SafepointStatus::Requested, generation, threads);
            if self
                .0
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some((generation, threads));
            }
        }
    }

    /// Mints a fresh token: back to `Idle` under the next generation.
    fn finish(&self) {
        self.update(|status, generation, threads| {
            if status != SafepointStatus::Requested {
                return None;
            }
            let next_gen = generation.wrapping_add(1) & (Self::GEN_MASK as u32);
            Some(Self::pack(SafepointStatus::Idle, next_gen, threads))
        });
    }

    /// Invalidates the token for good.
    fn shut_down(&self) {
        self.update(|_, generation, threads| {
            Some(Self::pack(SafepointStatus::ShutDown, generation, threads))
        });
    }

    fn is_shut_down(&self) -> bool {
        self.load(Ordering::Acquire).0 == SafepointStatus::ShutDown
    }
}

impl Default for SafepointState {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafepointPhase {
    Idle = 0,
    Requested = 1,
    AtBarrier = 2,
    Executing = 3,
    Completing = 4,
}

impl From<u8> for SafepointPhase {
    fn from(val: u8) -> Self {
        match val {
            1 => SafepointPhase::Requested,
            2 => SafepointPhase::AtBarrier,
            3 => SafepointPhase::Executing,
            4 => SafepointPhase::Completing,
            _ => SafepointPhase::Idle,
        }
    }
}

pub type SafepointAction = Arc<dyn Fn(&RuntimeThread) + Send + Sync>;

struct SafepointRequest {
    generation: u32,
    action: SafepointAction,
    arrival: SenseBarrier,
    completion: SenseBarrier,
    fault_reported: AtomicBool,
}

/// Pauses every registered thread at its next poll point and runs an
/// action on each of them.
///
/// One request is in flight at a time. Between the arrival and completion
/// barriers no registered thread runs anything but the action.
pub struct SafepointManager {
    state: SafepointState,
    coordinator: Mutex<()>,
    request: Mutex<Option<Arc<SafepointRequest>>>,
    phase: AtomicU8,
    completed: AtomicU64,
    threads: Arc<ThreadManager>,
    faults: Arc<FaultChannel>,
}

impl SafepointManager {
    pub fn new(threads: Arc<ThreadManager>, faults: Arc<FaultChannel>) -> Self {
        Self {
            state: SafepointState::new(),
            coordinator: Mutex::new(()),
            request: Mutex::new(None),
            phase: AtomicU8::new(SafepointPhase::Idle as u8),
            completed: AtomicU64::new(0),
            threads,
            faults,
        }
    }

    pub fn phase(&self) -> SafepointPhase {
        SafepointPhase::from(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SafepointPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn live_threads(&self) -> u32 {
        self.state.load(Ordering::Acquire).2
    }

    pub fn generation(&self) -> u32 {
        self.state.load(Ordering::Acquire).1
    }

    pub fn completed_safepoints(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.is_shut_down()
    }

    /// Poll point. Joins a pending safepoint, otherwise returns after a
    /// single load. Fails for good once the runtime is shut down.
    #[inline(always)]
    pub fn poll(&self, thread: &RuntimeThread) -> Result<(), SafepointError> {
        if self.state.is_idle() {
            return Ok(());
        }
        self.poll_slow(thread)
    }

    #[cold]
    fn poll_slow(&self, thread: &RuntimeThread) -> Result<(), SafepointError> {
        if thread.is_in_safepoint() {
            return Ok(());
        }
        let request = self.request.lock().clone();
        if self.is_shut_down() {
            return Err(SafepointError::ShutDown);
        }
        match request {
            Some(request) => self.participate(thread, &request, false),
            None => Ok(()),
        }
    }

    pub fn register_thread(&self) {
        let _guard = self.coordinator.lock();
        self.state.register_thread();
        debug!("registered thread, {} live", self.live_threads());
    }

    /// Leaves the registry, joining any request that still counts this
    /// thread. Leaving a shut-down runtime is not an error.
    pub fn deregister_thread(
        &self,
        thread: &RuntimeThread,
    ) -> Result<(), SafepointError> {
        let mut result = Ok(());
        loop {
            match self.poll(thread) {
                Ok(()) | Err(SafepointError::ShutDown) => {}
                Err(err) => result = Err(err),
            }
            if self.state.try_deregister_thread() {
                debug!("deregistered {}, {} live", thread.id(), self.live_threads());
                return result;
            }
            // a request slipped in between the poll and the CAS
            std::hint::spin_loop();
        }
    }

    pub fn pause_all_threads_and_execute<F>(
        &self,
        thread: &RuntimeThread,
        action: F,
    ) -> Result<(), SafepointError>
    where
        F: Fn(&RuntimeThread) + Send + Sync + 'static,
    {
        if thread.is_in_safepoint() {
            return Err(SafepointError::Reentrant);
        }
        let _coordinator = self.lock_coordinator(thread)?;
        if self.is_shut_down() {
            return Err(SafepointError::ShutDown);
        }

        let request = self.start_request(0, Arc::new(action))?;
        info!(
            "safepoint {} requested by {} for {} threads",
            request.generation,
            thread.id(),
            request.arrival.parties()
        );
        self.threads.interrupt_all_threads();

        let result = self.participate(thread, &request, true);
        self.end_request(&request, &result);
        result
    }

    /// Variant for contexts that are not runtime threads (signal handlers,
    /// native callbacks). The caller joins both barriers but does not run
    /// the action.
    pub fn pause_all_threads_and_execute_signal_handler<F>(
        &self,
        action: F,
    ) -> Result<(), SafepointError>
    where
        F: Fn(&RuntimeThread) + Send + Sync + 'static,
    {
        if self.threads.current_thread().is_some() {
            return Err(SafepointError::AttachedThread);
        }
        let _coordinator = self.coordinator.lock();
        if self.is_shut_down() {
            return Err(SafepointError::ShutDown);
        }

        let request = self.start_request(1, Arc::new(action))?;
        info!(
            "safepoint {} requested from signal context for {} threads",
            request.generation,
            request.arrival.parties() - 1
        );
        self.threads.interrupt_all_threads();

        let result = self.run_rounds(None, &request, true);
        self.end_request(&request, &result);
        result
    }

    /// Takes the coordinator lock while still answering other requests,
    /// so a concurrent initiator is never left one party short.
    fn lock_coordinator(
        &self,
        thread: &RuntimeThread,
    ) -> Result<MutexGuard<'_, ()>, SafepointError> {
        loop {
            if let Some(guard) = self.coordinator.try_lock() {
                return Ok(guard);
            }
            self.poll(thread)?;
            let released = self.threads.release_permit(thread);
            let guard = self.coordinator.try_lock_for(COORDINATOR_RETRY);
            if released {
                self.threads.reacquire_permit(thread);
            }
            if let Some(guard) = guard {
                return Ok(guard);
            }
        }
    }

    fn start_request(
        &self,
        extra_parties: usize,
        action: SafepointAction,
    ) -> Result<Arc<SafepointRequest>, SafepointError> {
        let mut slot = self.request.lock();
        let (generation, live) =
            self.state.request().ok_or(SafepointError::ShutDown)?;
        let parties = live as usize + extra_parties;
        let request = Arc::new(SafepointRequest {
            generation,
            action,
            arrival: SenseBarrier::new(parties),
            completion: SenseBarrier::new(parties),
            fault_reported: AtomicBool::new(false),
        });
        *slot = Some(request.clone());
        self.set_phase(SafepointPhase::Requested);
        Ok(request)
    }

    /// Mints the fresh poll token and retires the request. Idempotent.
    fn finish_request(&self, request: &Arc<SafepointRequest>) {
        let mut slot = self.request.lock();
        if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, request)) {
            self.state.finish();
            *slot = None;
        }
    }

    fn end_request(
        &self,
        request: &Arc<SafepointRequest>,
        result: &Result<(), SafepointError>,
    ) {
        self.finish_request(request);
        if result.is_ok() {
            self.completed.fetch_add(1, Ordering::AcqRel);
            info!("safepoint {} complete", request.generation);
        }
        self.set_phase(SafepointPhase::Idle);
    }

    fn participate(
        &self,
        thread: &RuntimeThread,
        request: &Arc<SafepointRequest>,
        driver: bool,
    ) -> Result<(), SafepointError> {
        thread.clear_interrupt();
        let previous = thread.state();
        thread.set_state(ThreadState::Safepoint);
        let result = self.run_rounds(Some(thread), request, driver);
        thread.set_state(previous);
        result
    }

    fn run_rounds(
        &self,
        thread: Option<&RuntimeThread>,
        request: &Arc<SafepointRequest>,
        driver: bool,
    ) -> Result<(), SafepointError> {
        if driver {
            self.set_phase(SafepointPhase::AtBarrier);
        }
        let arrived = self.wait_on(thread, &request.arrival);
        if driver {
            self.finish_request(request);
        }
        if arrived.is_err() {
            return Err(self.broken(thread, request, "arrival"));
        }
        // every interrupt for this request has been sent by now
        if let Some(thread) = thread {
            thread.clear_interrupt();
        }

        if driver {
            self.set_phase(SafepointPhase::Executing);
        }
        if let Some(thread) = thread {
            thread.set_in_safepoint(true);
            let outcome =
                catch_unwind(AssertUnwindSafe(|| (request.action)(thread)));
            thread.set_in_safepoint(false);
            if let Err(payload) = outcome {
                self.faults.report(Fault {
                    kind: FaultKind::ActionPanicked,
                    thread: Some(thread.name().to_owned()),
                    message: panic_message(payload.as_ref()),
                });
                request.completion.break_barrier();
                return Err(self.broken(Some(thread), request, "completion"));
            }
        }

        if driver {
            self.set_phase(SafepointPhase::Completing);
        }
        if self.wait_on(thread, &request.completion).is_err() {
            return Err(self.broken(thread, request, "completion"));
        }
        Ok(())
    }

    fn wait_on(
        &self,
        thread: Option<&RuntimeThread>,
        barrier: &SenseBarrier,
    ) -> Result<bool, crate::BarrierError> {
        let Some(thread) = thread else {
            return barrier.wait();
        };
        let released = self.threads.release_permit(thread);
        let result = barrier.wait();
        if released {
            self.threads.reacquire_permit(thread);
        }
        result
    }

    fn broken(
        &self,
        thread: Option<&RuntimeThread>,
        request: &Arc<SafepointRequest>,
        stage: &str,
    ) -> SafepointError {
        {
            let mut slot = self.request.lock();
            if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, request)) {
                *slot = None;
            }
            self.state.shut_down();
        }
        if !request.fault_reported.swap(true, Ordering::AcqRel) {
            self.faults.report(Fault {
                kind: FaultKind::BrokenBarrier,
                thread: thread.map(|t| t.name().to_owned()),
                message: format!(
                    "{stage} barrier of safepoint {} broken",
                    request.generation
                ),
            });
        }
        SafepointError::BrokenBarrier
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "safepoint action panicked".to_owned()
    }
}
