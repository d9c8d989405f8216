use std::{
    fmt, io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use crate::{
    AttachError, CallKind, CallSite, CallSiteStatsSnapshot, ConfigError,
    DispatchSettings, FaultChannel, RuntimeError, RuntimeThread,
    SafepointError, SafepointManager, ThreadManager, ThreadSettings,
    ThreadState, Universe, Value,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCreateInfo {
    pub dispatch: DispatchSettings,
    pub threads: ThreadSettings,
}

impl RuntimeCreateInfo {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteId(u32);

impl CallSiteId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CallSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site{}", self.0)
    }
}

pub struct RuntimeShared {
    pub universe: Universe,
    pub threads: Arc<ThreadManager>,
    pub safepoints: SafepointManager,
    pub faults: Arc<FaultChannel>,
    dispatch: DispatchSettings,
    call_sites: RwLock<Vec<Arc<CallSite>>>,
}

/// Owner of everything attached threads share. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Result<Self, ConfigError> {
        info.validate()?;

        let threads = Arc::new(ThreadManager::new(&info.threads));
        let faults = Arc::new(FaultChannel::new());
        let safepoints = SafepointManager::new(threads.clone(), faults.clone());

        log::debug!(
            "runtime created: max chain {}, permit {:?}",
            info.dispatch.max_chain_length,
            info.threads.permit
        );

        Ok(Self {
            inner: Arc::new(RuntimeShared {
                universe: Universe::new(),
                threads,
                safepoints,
                faults,
                dispatch: info.dispatch,
                call_sites: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn universe(&self) -> &Universe {
        &self.inner.universe
    }

    pub fn threads(&self) -> &ThreadManager {
        &self.inner.threads
    }

    pub fn safepoints(&self) -> &SafepointManager {
        &self.inner.safepoints
    }

    pub fn faults(&self) -> &FaultChannel {
        &self.inner.faults
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.safepoints.is_shut_down() || self.inner.faults.is_tripped()
    }

    pub fn new_call_site(&self, selector: &str, kind: CallKind) -> CallSiteId {
        let site = Arc::new(CallSite::new(
            self.inner.universe.selector(selector),
            kind,
            &self.inner.dispatch,
        ));
        let mut sites = self.inner.call_sites.write();
        let id = CallSiteId(sites.len() as u32);
        sites.push(site);
        id
    }

    pub fn call_site(&self, id: CallSiteId) -> Option<Arc<CallSite>> {
        self.inner.call_sites.read().get(id.index()).cloned()
    }

    /// Totals over every call site of this runtime.
    pub fn call_site_stats(&self) -> CallSiteStatsSnapshot {
        self.inner
            .call_sites
            .read()
            .iter()
            .map(|site| site.stats())
            .fold(CallSiteStatsSnapshot::default(), CallSiteStatsSnapshot::merge)
    }

    pub fn dispatch(
        &self,
        id: CallSiteId,
        receiver: &Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let site = self
            .call_site(id)
            .ok_or(RuntimeError::InvalidCallSite(id.0))?;
        site.dispatch(&self.inner.universe, receiver, args)
    }

    /// Attaches the calling OS thread.
    pub fn attach_thread(&self, name: &str) -> Result<RuntimeProxy, AttachError> {
        RuntimeProxy::attach(self.clone(), name)
    }

    /// Spawns an OS thread that attaches itself before running `f`.
    pub fn spawn<F, T>(
        &self,
        name: &str,
        f: F,
    ) -> io::Result<JoinHandle<Result<T, AttachError>>>
    where
        F: FnOnce(&RuntimeProxy) -> T + Send + 'static,
        T: Send + 'static,
    {
        let runtime = self.clone();
        let thread_name = name.to_owned();
        thread::Builder::new().name(name.to_owned()).spawn(move || {
            let proxy = runtime.attach_thread(&thread_name)?;
            Ok(f(&proxy))
        })
    }

    pub fn pause_all_threads_and_execute_signal_handler<F>(
        &self,
        action: F,
    ) -> Result<(), SafepointError>
    where
        F: Fn(&RuntimeThread) + Send + Sync + 'static,
    {
        self.inner
            .safepoints
            .pause_all_threads_and_execute_signal_handler(action)
    }
}

/// Per-thread handle to a [`Runtime`]. Holds the thread's registration and,
/// in global permit mode, the permit while the thread runs.
pub struct RuntimeProxy {
    runtime: Runtime,
    thread: Arc<RuntimeThread>,
}

impl RuntimeProxy {
    fn attach(runtime: Runtime, name: &str) -> Result<Self, AttachError> {
        if runtime.is_shut_down() {
            return Err(AttachError::ShutDown);
        }
        let thread = runtime.inner.threads.attach(name)?;
        runtime.inner.safepoints.register_thread();
        runtime.inner.threads.reacquire_permit(&thread);

        let proxy = Self { runtime, thread };
        // a request may have been issued while we waited for the permit
        proxy.poll().map_err(|_| AttachError::ShutDown)?;
        Ok(proxy)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn thread(&self) -> &Arc<RuntimeThread> {
        &self.thread
    }

    #[inline(always)]
    pub fn poll(&self) -> Result<(), SafepointError> {
        self.runtime.inner.safepoints.poll(&self.thread)
    }

    /// Dispatches through a call site. The call boundary is a poll point.
    pub fn call(
        &self,
        id: CallSiteId,
        receiver: &Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        self.poll()?;
        self.runtime.dispatch(id, receiver, args)
    }

    pub fn pause_all_threads_and_execute<F>(
        &self,
        action: F,
    ) -> Result<(), SafepointError>
    where
        F: Fn(&RuntimeThread) + Send + Sync + 'static,
    {
        self.runtime
            .inner
            .safepoints
            .pause_all_threads_and_execute(&self.thread, action)
    }

    /// Runs `f` with the permit released. The thread stays registered, so
    /// `f` must return in bounded time or pending safepoints wait for it.
    pub fn blocking<T>(&self, f: impl FnOnce() -> T) -> Result<T, SafepointError> {
        let threads = &self.runtime.inner.threads;
        self.thread.set_state(ThreadState::Waiting);
        let released = threads.release_permit(&self.thread);
        let out = f();
        if released {
            threads.reacquire_permit(&self.thread);
        }
        self.thread.set_state(ThreadState::Running);
        self.poll()?;
        Ok(out)
    }

    /// Interruptible sleep that answers safepoints while waiting.
    ///
    /// Returns `false` when cut short by [`RuntimeThread::interrupt`].
    pub fn sleep(&self, duration: Duration) -> Result<bool, SafepointError> {
        let threads = &self.runtime.inner.threads;
        let deadline = Instant::now() + duration;
        loop {
            self.poll()?;
            if self.thread.clear_interrupt() {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }

            self.thread.set_state(ThreadState::Waiting);
            let released = threads.release_permit(&self.thread);
            // wakeups may be spurious or come from a safepoint request
            self.thread.parker().park_timeout(deadline - now);
            if released {
                threads.reacquire_permit(&self.thread);
            }
            self.thread.set_state(ThreadState::Running);
        }
    }

    /// Lets other threads take the permit, then polls.
    pub fn yield_permit(&self) -> Result<(), SafepointError> {
        let threads = &self.runtime.inner.threads;
        if threads.release_permit(&self.thread) {
            thread::yield_now();
            threads.reacquire_permit(&self.thread);
        }
        self.poll()
    }
}

impl Drop for RuntimeProxy {
    fn drop(&mut self) {
        let shared = &self.runtime.inner;
        if let Err(err) = shared.safepoints.deregister_thread(&self.thread) {
            log::warn!("{} left during a failed safepoint: {err}", self.thread.id());
        }
        shared.threads.release_permit(&self.thread);
        shared.threads.detach(&self.thread);
    }
}

impl fmt::Debug for RuntimeProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeProxy")
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arity, FaultKind, PermitMode, SafepointPhase, Visibility};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeCreateInfo::default()).unwrap()
    }

    fn global_runtime() -> Runtime {
        Runtime::new(RuntimeCreateInfo {
            threads: ThreadSettings {
                permit: PermitMode::Global,
            },
            ..Default::default()
        })
        .unwrap()
    }

    /// Spawns `count` attached workers that call `body` until `stop` is set.
    fn spawn_workers(
        rt: &Runtime,
        count: usize,
        stop: &Arc<AtomicBool>,
        body: impl Fn(&RuntimeProxy) + Send + Sync + Clone + 'static,
    ) -> Vec<JoinHandle<Result<(), AttachError>>> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let handles = (0..count)
            .map(|i| {
                let stop = stop.clone();
                let ready = ready_tx.clone();
                let body = body.clone();
                rt.spawn(&format!("worker-{i}"), move |proxy| {
                    ready.send(()).unwrap();
                    while !stop.load(Ordering::Acquire) {
                        body(proxy);
                    }
                })
                .unwrap()
            })
            .collect();
        for _ in 0..count {
            ready_rx.recv().unwrap();
        }
        handles
    }

    fn join_all(handles: Vec<JoinHandle<Result<(), AttachError>>>) {
        for h in handles {
            h.join().unwrap().unwrap();
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let info = RuntimeCreateInfo {
            dispatch: DispatchSettings {
                max_chain_length: 0,
            },
            ..Default::default()
        };
        assert!(Runtime::new(info).is_err());
    }

    #[test]
    fn unknown_call_site_is_an_error() {
        let a = runtime();
        let b = runtime();
        let id = a.new_call_site("succ", CallKind::Public);
        assert_eq!(a.dispatch(id, &Value::Integer(1), &[]), Ok(Value::Integer(2)));
        assert_eq!(
            b.dispatch(id, &Value::Integer(1), &[]),
            Err(RuntimeError::InvalidCallSite(0))
        );
    }

    #[test]
    fn proxy_call_polls_and_dispatches() {
        let rt = runtime();
        let proxy = rt.attach_thread("main").unwrap();
        let site = rt.new_call_site("+", CallKind::Public);
        for _ in 0..3 {
            assert_eq!(
                proxy.call(site, &Value::Integer(2), &[Value::Integer(2)]),
                Ok(Value::Integer(4))
            );
        }
        let stats = rt.call_site_stats();
        assert_eq!((stats.misses, stats.hits), (1, 2));
        assert_eq!(rt.safepoints().live_threads(), 1);
        drop(proxy);
        assert_eq!(rt.safepoints().live_threads(), 0);
        assert!(rt.threads().is_empty());
    }

    #[test]
    fn action_runs_once_per_live_thread_with_no_work_in_between() {
        const WORKERS: usize = 4;
        let rt = runtime();
        let stop = Arc::new(AtomicBool::new(false));
        let work = Arc::new(AtomicUsize::new(0));

        let handles = {
            let work = work.clone();
            spawn_workers(&rt, WORKERS, &stop, move |proxy| {
                proxy.poll().unwrap();
                work.fetch_add(1, Ordering::SeqCst);
            })
        };

        let main = rt.attach_thread("main").unwrap();
        for _ in 0..20 {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let observed = seen.clone();
            let counter = work.clone();
            main.pause_all_threads_and_execute(move |_| {
                observed.lock().push(counter.load(Ordering::SeqCst));
            })
            .unwrap();

            let seen = seen.lock();
            assert_eq!(seen.len(), WORKERS + 1);
            assert!(seen.iter().all(|&w| w == seen[0]), "work ran inside a safepoint: {seen:?}");
        }
        assert_eq!(rt.safepoints().completed_safepoints(), 20);

        stop.store(true, Ordering::Release);
        join_all(handles);
        drop(main);
        assert_eq!(rt.safepoints().live_threads(), 0);
    }

    #[test]
    fn concurrent_initiators_each_complete() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let runs = runs.clone();
                rt.spawn(&format!("initiator-{i}"), move |proxy| {
                    for _ in 0..10 {
                        let runs = runs.clone();
                        proxy
                            .pause_all_threads_and_execute(move |_| {
                                runs.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
                .unwrap()
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(rt.safepoints().completed_safepoints(), 40);
        // every action ran on between one and four threads
        let total = runs.load(Ordering::SeqCst);
        assert!((40..=160).contains(&total), "{total}");
    }

    #[test]
    fn deregistration_racing_requests_never_stalls() {
        let rt = runtime();
        let stop = Arc::new(AtomicBool::new(false));

        let churn = {
            let rt = rt.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut joined = 0;
                while !stop.load(Ordering::Acquire) {
                    let h = rt
                        .spawn("short-lived", |proxy| {
                            proxy.poll().unwrap();
                        })
                        .unwrap();
                    h.join().unwrap().unwrap();
                    joined += 1;
                }
                joined
            })
        };

        let main = rt.attach_thread("main").unwrap();
        for _ in 0..200 {
            main.pause_all_threads_and_execute(|_| {}).unwrap();
        }
        for _ in 0..50 {
            signal_from_unattached_thread(&rt);
        }
        stop.store(true, Ordering::Release);
        churn.join().unwrap();
        drop(main);
        assert_eq!(rt.safepoints().live_threads(), 0);
    }

    fn signal_from_unattached_thread(rt: &Runtime) {
        let rt = rt.clone();
        thread::spawn(move || {
            rt.pause_all_threads_and_execute_signal_handler(|_| {}).unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn signal_context_does_not_run_the_action() {
        let rt = runtime();
        let stop = Arc::new(AtomicBool::new(false));
        let handles = spawn_workers(&rt, 3, &stop, |proxy| {
            proxy.poll().unwrap();
        });

        let names = Arc::new(Mutex::new(Vec::new()));
        let seen = names.clone();
        rt.pause_all_threads_and_execute_signal_handler(move |t| {
            seen.lock().push(t.name().to_owned());
        })
        .unwrap();

        let mut names = names.lock().clone();
        names.sort();
        assert_eq!(names, vec!["worker-0", "worker-1", "worker-2"]);

        stop.store(true, Ordering::Release);
        join_all(handles);
    }

    #[test]
    fn global_permit_safepoint_completes() {
        let rt = global_runtime();
        let stop = Arc::new(AtomicBool::new(false));
        let handles = spawn_workers(&rt, 3, &stop, |proxy| {
            proxy.yield_permit().unwrap();
        });

        let main = rt.attach_thread("main").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let runs = runs.clone();
            main.pause_all_threads_and_execute(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            main.yield_permit().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 40);
        assert_eq!(rt.threads().permit().holder(), Some(main.thread().id()));

        // workers need the permit to observe `stop`
        stop.store(true, Ordering::Release);
        main.blocking(|| join_all(handles)).unwrap();
    }

    #[test]
    fn sleeping_threads_answer_safepoints_and_interrupts() {
        let rt = runtime();
        let (tx, rx) = mpsc::channel();
        let sleeper = rt
            .spawn("sleeper", move |proxy| {
                tx.send(proxy.thread().clone()).unwrap();
                let start = Instant::now();
                let completed = proxy.sleep(Duration::from_secs(30)).unwrap();
                (completed, start.elapsed())
            })
            .unwrap();
        let sleeper_thread = rx.recv().unwrap();

        let main = rt.attach_thread("main").unwrap();
        let ran_on = Arc::new(Mutex::new(Vec::new()));
        let seen = ran_on.clone();
        main.pause_all_threads_and_execute(move |t| {
            seen.lock().push(t.id());
        })
        .unwrap();
        assert!(ran_on.lock().contains(&sleeper_thread.id()));

        // the safepoint wakeup did not end the sleep
        let deadline = Instant::now() + Duration::from_secs(5);
        while sleeper_thread.state() != ThreadState::Waiting {
            assert!(Instant::now() < deadline, "sleeper did not go back to sleep");
            thread::sleep(Duration::from_millis(1));
        }

        sleeper_thread.interrupt();
        let (completed, elapsed) = sleeper.join().unwrap().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(30));
    }

    #[test]
    fn short_sleep_runs_to_completion() {
        let rt = runtime();
        let proxy = rt.attach_thread("main").unwrap();
        let start = Instant::now();
        assert_eq!(proxy.sleep(Duration::from_millis(20)), Ok(true));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn panicking_action_shuts_the_runtime_down() {
        let rt = runtime();
        let stop = Arc::new(AtomicBool::new(false));
        let handles = spawn_workers(&rt, 2, &stop, |proxy| {
            if proxy.poll().is_err() {
                // broken safepoint: wait for the test to stop us
                thread::sleep(Duration::from_millis(1));
            }
        });

        let main = rt.attach_thread("main").unwrap();
        let main_id = main.thread().id();
        let result = main.pause_all_threads_and_execute(move |t| {
            if t.id() != main_id {
                panic!("worker action failed");
            }
        });
        assert_eq!(result, Err(SafepointError::BrokenBarrier));
        assert!(rt.is_shut_down());
        assert_eq!(rt.safepoints().phase(), SafepointPhase::Idle);

        // the participant that claimed the report may still be recording it
        let broken = |faults: &[crate::Fault]| {
            faults.iter().filter(|f| f.kind == FaultKind::BrokenBarrier).count()
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while broken(&rt.faults().faults()) == 0 {
            assert!(Instant::now() < deadline, "broken barrier never reported");
            thread::sleep(Duration::from_millis(1));
        }
        let faults = rt.faults().faults();
        assert!(faults.iter().any(|f| f.kind == FaultKind::ActionPanicked));
        assert_eq!(broken(&faults), 1);

        // ordinary work is refused from now on
        let site = rt.new_call_site("succ", CallKind::Public);
        for _ in 0..3 {
            assert_eq!(main.poll(), Err(SafepointError::ShutDown));
            assert_eq!(
                main.call(site, &Value::Integer(1), &[]),
                Err(RuntimeError::Safepoint(SafepointError::ShutDown))
            );
        }
        assert_eq!(rt.call_site_stats().dispatches(), 0);
        assert_eq!(
            main.pause_all_threads_and_execute(|_| {}),
            Err(SafepointError::ShutDown)
        );
        stop.store(true, Ordering::Release);
        join_all(handles);
        drop(main);
        let late = thread::spawn({
            let rt = rt.clone();
            move || rt.attach_thread("late").map(|_| ())
        });
        assert_eq!(late.join().unwrap(), Err(AttachError::ShutDown));
    }

    #[test]
    fn redefinition_inside_a_safepoint_reaches_every_call_site() {
        let rt = runtime();
        let point = rt.universe().define_class("Point", None);
        let x = rt.universe().selector("x");
        point.define_method(x.clone(), Visibility::Public, Arity::Exact(0), |_, _| {
            Ok(Value::Integer(1))
        });
        let site = rt.new_call_site("x", CallKind::Public);
        let stop = Arc::new(AtomicBool::new(false));

        let handles = {
            let receiver = rt.universe().instantiate(&point);
            spawn_workers(&rt, 3, &stop, move |proxy| {
                let v = proxy.call(site, &receiver, &[]).unwrap();
                assert!(matches!(v, Value::Integer(1) | Value::Integer(2)));
            })
        };

        let main = rt.attach_thread("main").unwrap();
        let main_id = main.thread().id();
        let class = point.clone();
        main.pause_all_threads_and_execute(move |t| {
            if t.id() == main_id {
                class.define_method(x.clone(), Visibility::Public, Arity::Exact(0), |_, _| {
                    Ok(Value::Integer(2))
                });
            }
        })
        .unwrap();

        let receiver = rt.universe().instantiate(&point);
        assert_eq!(main.call(site, &receiver, &[]), Ok(Value::Integer(2)));

        stop.store(true, Ordering::Release);
        join_all(handles);
        assert!(rt.call_site(site).unwrap().cache_len() <= 8);
    }
}
