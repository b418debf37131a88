#![forbid(unsafe_code)]

//! The symbolic execution engine: values, the copy-on-write heap, execution
//! contexts with path forking, and the IR interpreter.

pub mod context;
pub mod heap;
pub mod interp;
pub mod libcall;
pub mod prune;
pub mod report;
pub mod value;

pub use context::{Context, ContextSet, Frame, Governor, LogEntry};
pub use heap::{Addr, ShEnv, ShHeap};
pub use interp::{Flow, Interp};
pub use libcall::{arg_named, LibCallArgs, LibCallFn, LibCallMap};
pub use report::{ctx_report, CtxReport, RunReport};
pub use value::{FuncParams, LogLevel, ShError, ShFunc, ShObj, ShValue};
