//! Trait surfaces that plugin authors implement against.
//!
//! `jana-core` drives these traits; it never knows about concrete source,
//! factory, or processor implementations beyond what is declared here.

mod error;
mod event;
mod factory;
mod fold;
mod ids;
mod processor;
mod service;
mod source;
mod unfold;

pub use error::FactoryError;
pub use event::{EventContext, EventLevel, EventView, FactorySetAccess};
pub use factory::{Factory, FactoryFlags};
pub use fold::{FoldStatus, Folder};
pub use ids::{EventNumber, LocationId, RunNumber};
pub use processor::Processor;
pub use service::Service;
pub use source::{EventSource, SourceStatus};
pub use unfold::{UnfoldStatus, Unfolder};
