//! A DICOM service class user for query, retrieve, storage and verification.
//!
//! [`ServiceClassUser`] is the entry point:
//! each of its operations runs on an association of its own,
//! opened through a [`Connector`](dimse_ul::Connector)
//! and driven by a reader thread (see [`dispatch`])
//! which routes responses back to the waiting caller.
//! Query results are kept in a shared [`cache`]
//! which is cleared as a whole at a fixed interval.
//!
//! Query identifiers are built in [`query`],
//! C-MOVE batches in [`retrieve`],
//! and C-STORE data sources in [`store`].

pub mod cache;
pub mod dispatch;
pub mod options;
pub mod query;
pub mod retrieve;
pub mod service;
pub mod store;

pub use cache::{CacheKey, ResultCache};
pub use options::ScuOptions;
pub use query::QueryLevel;
pub use service::{Retrieved, ServiceClassUser};
