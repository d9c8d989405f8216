mod barrier;
mod dispatch;
mod error;
mod fault;
mod interning;
mod module;
mod object;
mod parker;
mod runtime;
mod safepoint;
mod shape;
mod threads;
mod universe;

pub use barrier::{BarrierError, SenseBarrier};
pub use dispatch::*;
pub use error::*;
pub use fault::*;
pub use interning::{InternedSelectors, Selector};
pub use module::*;
pub use object::*;
pub use parker::NativeParker;
pub use runtime::*;
pub use safepoint::{
    SafepointAction, SafepointManager, SafepointPhase, SafepointState,
    SafepointStatus,
};
pub use shape::*;
pub use threads::*;
pub use universe::*;
