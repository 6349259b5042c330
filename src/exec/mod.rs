mod discovery;
mod runner;
mod tracker;

pub use discovery::BinaryLocator;
pub use runner::{terminate, DoneSignal, Execution, ProcessRunner};
pub use tracker::{
    ExecutionStatus, ExecutionTracker, FsTracker, LivenessCheck, OsLiveness, OutputReader,
};
