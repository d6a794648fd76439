//! Core pool orchestration: jobs, protocol, workers, handles, and the
//! manager loop.

pub mod error;
pub mod handle;
pub mod job;
pub mod persist;
pub mod pool;
pub mod protocol;
pub mod sink;
pub mod spawn;
pub mod worker;

pub use error::{AppResult, PoolError};
pub use handle::{DoneCallback, WorkerHandle};
pub use job::{
    JobId, JobRegistry, JobSpec, JobState, NoHooks, ProgressHooks, ResultEnvelope, RunContext,
    Solver, SolverMethod, SolverRun,
};
pub use persist::{JsonExporter, ResultExporter};
pub use pool::{PoolManager, PoolRunner, PoolStats, StatusBoard};
pub use protocol::{AckToken, ProtocolMsg, WireMsg};
pub use sink::{LogSink, MemorySink, SinkRotation, TracingSink, WriterSink};
pub use spawn::{
    job_channels, worker_main, Duplex, HandleEndpoints, ProcessSpawner, ThreadSpawner,
    WorkerBootstrap, WorkerEndpoints, WorkerLink, WorkerSpawner,
};
pub use worker::{run_job, CancelProbe, ChannelSink};
