use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{AttachError, NativeParker};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (manager id, thread) for every manager this OS thread is attached to.
    static CURRENT: RefCell<Vec<(u64, Arc<RuntimeThread>)>> =
        const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created = 0,
    Running = 1,
    /// Blocked outside the runtime with the permit released.
    Waiting = 2,
    Safepoint = 3,
    Dead = 4,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Created,
            1 => ThreadState::Running,
            2 => ThreadState::Waiting,
            3 => ThreadState::Safepoint,
            _ => ThreadState::Dead,
        }
    }
}

/// Runtime-side view of one attached OS thread.
pub struct RuntimeThread {
    id: ThreadId,
    name: Arc<str>,
    parker: NativeParker,
    state: AtomicU8,
    interrupted: AtomicBool,
    in_safepoint: AtomicBool,
}

impl RuntimeThread {
    fn new(name: &str) -> Self {
        Self {
            id: ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)),
            name: Arc::from(name),
            parker: NativeParker::new(),
            state: AtomicU8::new(ThreadState::Created as u8),
            interrupted: AtomicBool::new(false),
            in_safepoint: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parker(&self) -> &NativeParker {
        &self.parker
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Wakes the thread out of any parker wait and leaves a pending flag.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.parker.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Drops a pending interruption together with its parker token.
    pub fn clear_interrupt(&self) -> bool {
        let was = self.interrupted.swap(false, Ordering::AcqRel);
        if was {
            self.parker.consume_token();
        }
        was
    }

    pub fn is_in_safepoint(&self) -> bool {
        self.in_safepoint.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_safepoint(&self, value: bool) {
        self.in_safepoint.store(value, Ordering::Release);
    }
}

impl fmt::Debug for RuntimeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermitMode {
    /// Attached threads run ordinary work in parallel.
    #[default]
    Parallel,
    /// One global permit: a single attached thread runs at a time.
    Global,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadSettings {
    pub permit: PermitMode,
}

#[derive(Debug, Default)]
struct PermitState {
    owner: Option<ThreadId>,
    queue: VecDeque<ThreadId>,
}

/// The global execution permit in [`PermitMode::Global`], a no-op otherwise.
///
/// Released permits are handed to the longest waiter, so a thread that
/// yields cannot take the permit straight back while others wait.
#[derive(Debug)]
pub struct ExecutionPermit {
    mode: PermitMode,
    state: Mutex<PermitState>,
    handed_off: Condvar,
}

impl ExecutionPermit {
    pub fn new(mode: PermitMode) -> Self {
        Self {
            mode,
            state: Mutex::new(PermitState::default()),
            handed_off: Condvar::new(),
        }
    }

    pub fn mode(&self) -> PermitMode {
        self.mode
    }

    pub fn acquire(&self, thread: &RuntimeThread) {
        if self.mode == PermitMode::Parallel {
            return;
        }
        let mut state = self.state.lock();
        let owner = state.owner;
        match owner {
            Some(id) if id == thread.id => return,
            None if state.queue.is_empty() => {
                state.owner = Some(thread.id);
                return;
            }
            _ => state.queue.push_back(thread.id),
        }
        while state.owner != Some(thread.id) {
            self.handed_off.wait(&mut state);
        }
    }

    /// Returns `true` if `thread` held the permit.
    pub fn release(&self, thread: &RuntimeThread) -> bool {
        if self.mode == PermitMode::Parallel {
            return false;
        }
        let mut state = self.state.lock();
        if state.owner != Some(thread.id) {
            return false;
        }
        state.owner = state.queue.pop_front();
        if state.owner.is_some() {
            self.handed_off.notify_all();
        }
        true
    }

    pub fn holder(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }
}

/// Table of attached threads plus the execution permit.
pub struct ThreadManager {
    id: u64,
    threads: RwLock<HashMap<ThreadId, Arc<RuntimeThread>>>,
    permit: ExecutionPermit,
}

impl ThreadManager {
    pub fn new(settings: &ThreadSettings) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            threads: RwLock::new(HashMap::new()),
            permit: ExecutionPermit::new(settings.permit),
        }
    }

    /// Attaches the calling OS thread.
    pub fn attach(
        &self,
        name: &str,
    ) -> Result<Arc<RuntimeThread>, AttachError> {
        if self.current_thread().is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        let thread = Arc::new(RuntimeThread::new(name));
        thread.set_state(ThreadState::Running);
        self.threads.write().insert(thread.id, thread.clone());
        CURRENT.with(|current| {
            current.borrow_mut().push((self.id, thread.clone()));
        });
        log::debug!("attached {} ({})", thread.id, thread.name);
        Ok(thread)
    }

    /// Must run on the thread that attached.
    pub fn detach(&self, thread: &RuntimeThread) {
        thread.set_state(ThreadState::Dead);
        self.threads.write().remove(&thread.id);
        CURRENT.with(|current| {
            current
                .borrow_mut()
                .retain(|(manager, t)| *manager != self.id || t.id != thread.id);
        });
        log::debug!("detached {} ({})", thread.id, thread.name);
    }

    pub fn current_thread(&self) -> Option<Arc<RuntimeThread>> {
        CURRENT.with(|current| {
            current
                .borrow()
                .iter()
                .find(|(manager, _)| *manager == self.id)
                .map(|(_, thread)| thread.clone())
        })
    }

    pub fn threads(&self) -> Vec<Arc<RuntimeThread>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kicks every attached thread out of its current wait so it reaches a
    /// poll point.
    pub fn interrupt_all_threads(&self) {
        for thread in self.threads.read().values() {
            thread.interrupt();
        }
    }

    pub fn permit(&self) -> &ExecutionPermit {
        &self.permit
    }

    pub fn release_permit(&self, thread: &RuntimeThread) -> bool {
        self.permit.release(thread)
    }

    pub fn reacquire_permit(&self, thread: &RuntimeThread) {
        self.permit.acquire(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn attach_registers_the_current_thread() {
        let manager = ThreadManager::new(&ThreadSettings::default());
        assert!(manager.current_thread().is_none());

        let thread = manager.attach("main").unwrap();
        assert_eq!(thread.state(), ThreadState::Running);
        assert_eq!(manager.current_thread().unwrap().id(), thread.id());
        assert_eq!(manager.attach("again").unwrap_err(), AttachError::AlreadyAttached);
        assert_eq!(manager.len(), 1);

        manager.detach(&thread);
        assert!(manager.current_thread().is_none());
        assert_eq!(thread.state(), ThreadState::Dead);
        assert!(manager.is_empty());
    }

    #[test]
    fn current_thread_is_per_manager() {
        let a = ThreadManager::new(&ThreadSettings::default());
        let b = ThreadManager::new(&ThreadSettings::default());
        let ta = a.attach("a").unwrap();
        assert!(b.current_thread().is_none());
        let tb = b.attach("b").unwrap();
        assert_ne!(ta.id(), tb.id());
        assert_eq!(a.current_thread().unwrap().id(), ta.id());
        a.detach(&ta);
        b.detach(&tb);
    }

    #[test]
    fn interrupt_wakes_a_parked_thread() {
        let manager = Arc::new(ThreadManager::new(&ThreadSettings::default()));
        let (tx, rx) = std::sync::mpsc::channel();

        let worker = {
            let manager = manager.clone();
            thread::spawn(move || {
                let me = manager.attach("sleeper").unwrap();
                tx.send(()).unwrap();
                let woken = me.parker().park_timeout(Duration::from_secs(5));
                let interrupted = me.clear_interrupt();
                manager.detach(&me);
                (woken, interrupted)
            })
        };

        rx.recv().unwrap();
        manager.interrupt_all_threads();
        assert_eq!(worker.join().unwrap(), (true, true));
    }

    #[test]
    fn parallel_permit_is_a_no_op() {
        let permit = ExecutionPermit::new(PermitMode::Parallel);
        let t = RuntimeThread::new("t");
        permit.acquire(&t);
        assert_eq!(permit.holder(), None);
        assert!(!permit.release(&t));
    }

    #[test]
    fn global_permit_admits_one_holder() {
        let permit = Arc::new(ExecutionPermit::new(PermitMode::Global));
        let first = Arc::new(RuntimeThread::new("first"));
        let second = Arc::new(RuntimeThread::new("second"));

        permit.acquire(&first);
        permit.acquire(&first);
        assert_eq!(permit.holder(), Some(first.id()));

        let waiter = {
            let permit = permit.clone();
            let second = second.clone();
            thread::spawn(move || {
                permit.acquire(&second);
                permit.holder()
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert_eq!(permit.holder(), Some(first.id()));
        assert!(!permit.release(&second));
        assert!(permit.release(&first));
        assert_eq!(waiter.join().unwrap(), Some(second.id()));
    }
}
