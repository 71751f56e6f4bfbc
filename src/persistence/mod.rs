//! Persistence Module
//!
//! Versioned, file-backed storage of workflow state.
//!
//! # Components
//!
//! - [`WorkflowStore`]: Current documents, history, recovery and listing
//! - [`codec`]: Tagged JSON form that keeps sets, enums and timestamps typed

pub mod codec;
pub mod store;

pub use codec::{decode, encode_workflow, plain_workflow, to_plain};
pub use store::{HistoryEntry, LoadedWorkflow, WorkflowListing, WorkflowStore, RECOVERED_STATE};
