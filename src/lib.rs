//! kdispatch: dispatches kernel/BSP tests onto virtual hardware.
//!
//! Test plans are queued by priority, matched against a catalog of
//! environment templates (emulators, virtual boards, real targets behind a
//! relay), and run in a bounded pool of environments. Every test ends in
//! exactly one terminal record, even across dispatcher restarts.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Hardware** ([`hardware`]): requirement/capability matching
//! - **Store** ([`store`]): durable plans and records, priority ordering
//! - **Providers** ([`provider`]): backends that create environments
//! - **Orchestrator** ([`orchestrator`]): pool, runner and the dispatch loop
//! - **Status** ([`status`]) and **Report** ([`report`]): read-only views
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kdispatch::config::{load_config, load_plan};
//! use kdispatch::orchestrator::Orchestrator;
//! use kdispatch::provider::local::LocalProvider;
//! use kdispatch::store::persist::MemoryPersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("kdispatch.toml"))?;
//!     let provider = LocalProvider::new(Default::default());
//!     let orchestrator =
//!         Orchestrator::new(&config, provider, Arc::new(MemoryPersistence::new()))?;
//!     let handle = orchestrator.handle();
//!     tokio::spawn(orchestrator.run());
//!
//!     let plan = handle.submit_plan(load_plan(std::path::Path::new("nightly.toml"))?)?;
//!     println!("{:?}", handle.execution_status(&plan.id)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod hardware;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod report;
pub mod status;
pub mod store;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use hardware::{HardwareProfile, matches};
pub use model::{ExecutionConfig, ExecutionPlan, ExecutionRecord, RecordState, TestCase};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use provider::{Sandbox, SandboxProvider};
pub use store::{PlanStore, PlanSubmission};
