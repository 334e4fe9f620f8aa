// =============================================================================
// Worker loops — the polling consumers that advance the workflow tables
// =============================================================================

pub mod dispatcher;
pub mod orchestrator;
pub mod run_worker;
pub mod watchdog;

pub use dispatcher::TaskDispatcher;
pub use orchestrator::ExecutionOrchestrator;
pub use run_worker::RunWorker;
pub use watchdog::TaskWatchdog;
