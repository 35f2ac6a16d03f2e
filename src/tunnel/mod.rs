pub mod engine;
pub mod scripts;
pub mod uapi;
pub mod worker;

pub use engine::{Adapter, CommandEngine, MockEngine, TunnelEngine};
pub use worker::{ShutdownWatchdog, TunnelWorker};
