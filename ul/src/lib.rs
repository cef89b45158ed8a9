//! DIMSE message exchange over the DICOM upper layer protocol.
//!
//! - The [`message`] module binds a command set
//!   to an optional, lazily decoded data set.
//! - The [`command`] and [`status`] modules
//!   build command sets and interpret response statuses.
//! - The [`role_selection`] module encodes and decodes
//!   the SCP/SCU role selection negotiation sub-item.
//! - The [`association`] module defines the association contract
//!   consumed by service operations,
//!   and implements it over TCP.
//! - The [`codec`] and [`transfer`] modules
//!   are the boundary to data set encoding,
//!   as provided by `dicom-object`.
//!
//! Protocol data units themselves are read and written
//! through [`dicom_ul::pdu`].

pub mod association;
pub mod codec;
pub mod command;
pub mod message;
pub mod role_selection;
pub mod status;
pub mod transfer;

/// The implementation class UID sent during association negotiation.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.214381960384152627148463547617447346531";

/// The implementation version name sent during association negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE-RS 0.1";

// re-exports

pub use association::{
    AcceptedContext, Association, AssociationRequest, AssociationState, Connector,
    ProposedContext, ReleaseMode,
};
pub use message::{DataSource, DimseMessage};
pub use role_selection::RoleSelection;
