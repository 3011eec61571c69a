//! The JANA processing engine: topology, scheduler, mailboxes, pools, and
//! the per-event factory/processor runtime.
//!
//! `jana-contracts` defines the traits plugin authors implement against;
//! this crate drives them. Nothing here knows about concrete sources,
//! factories, or processors beyond those trait surfaces.

pub mod arrow;
pub mod error;
pub mod event;
pub mod factory_set;
pub mod mailbox;
pub mod metrics;
pub mod parameters;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod thread_manager;
pub mod topology;

pub use error::{EngineError, Result};
pub use event::{Event, Lineage};
pub use factory_set::{FactoryHandle, FactorySet};
pub use mailbox::{Mailbox, PopStatus, QueueFull};
pub use metrics::{ArrowMetrics, ArrowStatus};
pub use parameters::{ParameterError, ParameterManager};
pub use pool::Pool;
pub use report::FinalReport;
pub use scheduler::{Assignment, Scheduler};
pub use service::{OutputLock, ServiceRegistry};
pub use thread_manager::{AffinityPolicy, ThreadManager, ThreadManagerState};
pub use topology::{FactoryCatalog, Topology, TopologyBuilder};
