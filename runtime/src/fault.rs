use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    BrokenBarrier,
    ActionPanicked,
}

/// A failure the runtime cannot recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub thread: Option<String>,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let thread = self.thread.as_deref().unwrap_or("<signal>");
        write!(f, "{:?} on {thread}: {}", self.kind, self.message)
    }
}

pub type FaultHandler = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Top-level sink for fatal faults. Tripping it is permanent.
pub struct FaultChannel {
    handler: RwLock<Option<FaultHandler>>,
    tripped: AtomicBool,
    faults: Mutex<Vec<Fault>>,
}

impl FaultChannel {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            tripped: AtomicBool::new(false),
            faults: Mutex::new(Vec::new()),
        }
    }

    pub fn set_handler(&self, handler: FaultHandler) {
        *self.handler.write() = Some(handler);
    }

    pub fn report(&self, fault: Fault) {
        log::error!("fatal runtime fault: {fault}");
        self.tripped.store(true, Ordering::Release);
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(&fault);
        }
        self.faults.lock().push(fault);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }
}

impl Default for FaultChannel {
    fn default() -> Self {
        Self::new()
    }
}
