//! DICOM association module
//!
//! This module defines the association contract
//! consumed by service operations:
//! the [`Association`] trait drives one negotiated conversation,
//! and a [`Connector`] opens new associations
//! from an [`AssociationRequest`] template.
//!
//! The [`tcp`] module implements both over TCP/IP,
//! as requester via [`TcpConnector`][1]
//! and as acceptor via [`TcpAssociation::accept`][2].
//!
//! [1]: crate::association::tcp::TcpConnector
//! [2]: crate::association::tcp::TcpAssociation::accept
pub mod tcp;

pub(crate) mod pdata;

use crate::{codec, message, role_selection, DimseMessage, RoleSelection};
use snafu::{ensure, Backtrace, Snafu};
use std::fmt;
use std::time::Duration;

pub use tcp::{AcceptorOptions, TcpAssociation, TcpConnector};

/// The default application context name.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    /// could not connect to the peer
    Connect {
        address: String,
        source: std::io::Error,
    },

    /// timed out waiting for the peer
    Timeout { backtrace: Backtrace },

    /// the association was released or the connection closed
    Closed { backtrace: Backtrace },

    #[snafu(display("association rejected: {}", reason))]
    Rejected { reason: String, backtrace: Backtrace },

    /// the association was aborted
    Aborted { backtrace: Backtrace },

    /// no presentation context was accepted
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("unknown presentation context id {}", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display("presentation context id {} is already proposed", id))]
    DuplicateContext { id: u8, backtrace: Backtrace },

    #[snafu(display("presentation context id {} is not an odd number", id))]
    InvalidContextId { id: u8, backtrace: Backtrace },

    /// failed to send PDU message
    SendPdu {
        #[snafu(backtrace)]
        source: dicom_ul::pdu::writer::Error,
    },

    /// failed to receive PDU message
    ReceivePdu {
        #[snafu(backtrace)]
        source: dicom_ul::pdu::reader::Error,
    },

    /// socket I/O failed
    Wire {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not encode or decode a command set
    Codec { source: codec::Error },

    /// could not write the message data set
    Message { source: message::Error },

    /// inconsistent role selection sub-item
    RoleSelection { source: role_selection::Error },

    #[snafu(display(
        "fragment for presentation context {} inside a message on {}",
        got,
        expected
    ))]
    MixedPresentationContexts {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected PDU from peer: {}", pdu))]
    UnexpectedPdu { pdu: String, backtrace: Backtrace },

    #[snafu(display("operation not possible in state {:?}", state))]
    InvalidState {
        state: AssociationState,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Whether this is the timeout condition of a timed read,
    /// after which the association remains usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The state of an association.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationState {
    Idle,
    Requesting,
    Accepting,
    Established,
    Releasing,
    Closed,
    Aborted,
}

/// How to end an association.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum ReleaseMode {
    /// A-RELEASE-RQ, waiting for the peer's reply
    #[default]
    Graceful,
    /// A-ABORT, without waiting for anything
    Abort,
}

/// A presentation context to propose to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProposedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
    pub role: Option<RoleSelection>,
}

/// Build a presentation context proposal.
pub fn propose_context<T>(
    id: u8,
    abstract_syntax: impl Into<String>,
    transfer_syntaxes: impl IntoIterator<Item = T>,
    role: Option<RoleSelection>,
) -> ProposedContext
where
    T: Into<String>,
{
    ProposedContext {
        id,
        abstract_syntax: abstract_syntax.into(),
        transfer_syntaxes: transfer_syntaxes.into_iter().map(Into::into).collect(),
        role,
    }
}

/// A presentation context accepted by both peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AcceptedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
    /// whether the requester may act as SCU
    pub scu: bool,
    /// whether the requester may act as SCP
    pub scp: bool,
}

/// The template of an association request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRequest {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub max_pdu_length: u32,
    contexts: Vec<ProposedContext>,
}

impl AssociationRequest {
    pub fn new(calling_ae_title: impl Into<String>, called_ae_title: impl Into<String>) -> Self {
        AssociationRequest {
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
            max_pdu_length: dicom_ul::pdu::reader::DEFAULT_MAX_PDU,
            contexts: Vec::new(),
        }
    }

    /// Add a presentation context to the request.
    ///
    /// Fails if the id is even or already in use.
    pub fn add_context(&mut self, context: ProposedContext) -> Result<()> {
        ensure!(context.id % 2 == 1, InvalidContextIdSnafu { id: context.id });
        ensure!(
            self.contexts.iter().all(|c| c.id != context.id),
            DuplicateContextSnafu { id: context.id }
        );
        self.contexts.push(context);
        Ok(())
    }

    /// Remove the presentation context with the given id.
    pub fn remove_context(&mut self, id: u8) -> Option<ProposedContext> {
        let index = self.contexts.iter().position(|c| c.id == id)?;
        Some(self.contexts.remove(index))
    }

    pub fn contexts(&self) -> &[ProposedContext] {
        &self.contexts
    }

    pub fn context(&self, id: u8) -> Option<&ProposedContext> {
        self.contexts.iter().find(|c| c.id == id)
    }
}

/// Message id sequence of one association.
///
/// Starts at 1 and strictly increases.
#[derive(Debug, Default, Clone)]
pub struct MessageIdCounter {
    current: u16,
}

impl MessageIdCounter {
    pub fn next(&mut self) -> u16 {
        self.current = match self.current.checked_add(1) {
            Some(id) => id,
            // wrap around past 0, which is not a valid id
            None => 1,
        };
        self.current
    }

    /// The most recently allocated id, 0 if none was allocated.
    pub fn current(&self) -> u16 {
        self.current
    }
}

/// One negotiated conversation with a peer.
///
/// An association is driven by one caller at a time.
pub trait Association: Send {
    fn state(&self) -> AssociationState;

    /// The presentation contexts accepted during negotiation.
    fn presentation_contexts(&self) -> &[AcceptedContext];

    /// Allocate the next message id.
    fn next_message_id(&mut self) -> u16;

    /// The most recently allocated message id.
    fn current_message_id(&self) -> u16;

    /// Read the next complete DIMSE message,
    /// waiting at most `timeout` for the peer.
    ///
    /// Fails with [`Error::Timeout`] if nothing arrived in time,
    /// which is distinct from [`Error::Closed`].
    fn read(&mut self, timeout: Duration) -> Result<DimseMessage>;

    /// Send a DIMSE message on its presentation context.
    fn write(&mut self, message: &mut DimseMessage) -> Result<()>;

    /// Send an A-RELEASE-RQ without waiting for the reply.
    ///
    /// The reply surfaces as [`Error::Closed`] on the next read.
    fn write_release_request(&mut self) -> Result<()>;

    /// End the association.
    fn release(&mut self, mode: ReleaseMode) -> Result<()>;

    /// Resolve an accepted context by abstract and transfer syntax.
    fn accepted_context(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
    ) -> Option<&AcceptedContext> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax && pc.transfer_syntax == transfer_syntax)
    }

    /// Resolve an accepted context by abstract syntax alone.
    fn accepted_transfer_syntax(&self, abstract_syntax: &str) -> Option<&AcceptedContext> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
    }

    /// Resolve an accepted context by presentation context id.
    fn accepted_context_by_id(&self, id: u8) -> Option<&AcceptedContext> {
        self.presentation_contexts().iter().find(|pc| pc.id == id)
    }
}

impl fmt::Debug for dyn Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("state", &self.state())
            .field("presentation_contexts", &self.presentation_contexts())
            .finish()
    }
}

/// A factory of associations.
pub trait Connector: Send + Sync {
    /// Request an association with the peer,
    /// waiting at most `timeout` for it to be established.
    fn connect(
        &self,
        request: &AssociationRequest,
        timeout: Duration,
    ) -> Result<Box<dyn Association>>;
}
