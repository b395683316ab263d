//! Process lifecycle: the server supervisor, background tasks, signals and
//! fatal-error handling.

pub mod fatal;
pub mod signals;
pub mod supervisor;
pub mod tasks;

pub use fatal::{ExitProcess, FatalHandler, ShutdownOnFatal, FATAL_EXIT_CODE};
pub use signals::shutdown_signal;
pub use supervisor::{LifecycleError, Server, StopHandle, SupervisorState};
pub use tasks::{
    BackgroundTask, FnTask, Lifetime, TaskFailure, TaskGroup, TaskHandle, TaskState,
};
