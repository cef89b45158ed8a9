//! Associations over TCP/IP.
//!
//! [`TcpConnector`] requests new associations from a remote node,
//! while [`TcpAssociation::accept`] negotiates an association
//! requested by a peer on an accepted TCP stream.
//! Both produce a [`TcpAssociation`],
//! which reassembles P-DATA fragments into [`DimseMessage`]s.
use super::pdata::PDataWriter;
use super::{
    AbortedSnafu, AcceptedContext, Association, AssociationRequest, AssociationState,
    ClosedSnafu, CodecSnafu, ConnectSnafu, Connector, InvalidStateSnafu, MessageIdCounter,
    Error, MessageSnafu, MixedPresentationContextsSnafu, NoAcceptedPresentationContextsSnafu,
    ReceivePduSnafu, RejectedSnafu, ReleaseMode, Result, RoleSelectionSnafu, SendPduSnafu,
    TimeoutSnafu, UnexpectedPduSnafu, UnknownPresentationContextSnafu, WireSnafu,
    APPLICATION_CONTEXT_NAME,
};
use crate::transfer::trim_uid;
use crate::{codec, DimseMessage, RoleSelection, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use dicom_ul::pdu::reader::{DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE};
use dicom_ul::pdu::{
    read_pdu, write_pdu, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem,
};
use snafu::{ensure, IntoError, OptionExt, ResultExt};
use std::borrow::Cow;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long to wait for the peer's reply to a release request.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an acceptor waits for the association request by default.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// PDU type and length.
const PDU_HEADER_LENGTH: usize = 6;

/// Requests associations from a remote node over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    strict: bool,
}

impl TcpConnector {
    /// A connector to the node at the given socket address,
    /// such as `"localhost:104"`.
    pub fn new(address: impl Into<String>) -> Self {
        TcpConnector {
            address: address.into(),
            strict: true,
        }
    }

    /// Override strict mode,
    /// in which PDUs longer than the maximum PDU length are refused.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        request: &AssociationRequest,
        timeout: Duration,
    ) -> Result<Box<dyn Association>> {
        let association = TcpAssociation::request(&self.address, request, timeout, self.strict)?;
        Ok(Box::new(association))
    }
}

/// Options for accepting associations requested by peers.
#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    /// the AE title of this node
    pub ae_title: String,
    /// the abstract syntaxes to accept
    pub abstract_syntaxes: Vec<String>,
    /// the transfer syntaxes to accept, in order of preference
    pub transfer_syntaxes: Vec<String>,
    /// accept any abstract syntax
    pub promiscuous: bool,
    pub max_pdu_length: u32,
    pub strict: bool,
    /// how long to wait for the peer's association request,
    /// `None` to wait indefinitely
    pub read_timeout: Option<Duration>,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        AcceptorOptions {
            ae_title: "THIS-SCP".to_string(),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: Vec::new(),
            promiscuous: false,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            read_timeout: Some(ACCEPT_TIMEOUT),
        }
    }
}

/// A DIMSE message being reassembled from P-DATA fragments.
#[derive(Debug, Default)]
struct PartialMessage {
    presentation_context_id: u8,
    command: Vec<u8>,
    command_complete: bool,
    data: Vec<u8>,
    data_complete: bool,
}

/// An association over a TCP stream.
#[derive(Debug)]
pub struct TcpAssociation {
    socket: TcpStream,
    state: AssociationState,
    presentation_contexts: Vec<AcceptedContext>,
    /// the maximum PDU length this node admits
    max_pdu_length: u32,
    /// the maximum PDU length the peer admits
    peer_max_pdu_length: u32,
    strict: bool,
    message_ids: MessageIdCounter,
    partial: Option<PartialMessage>,
}

impl TcpAssociation {
    /// Request an association from the node at `address`.
    pub fn request(
        address: &str,
        request: &AssociationRequest,
        timeout: Duration,
        strict: bool,
    ) -> Result<Self> {
        let addr = address
            .to_socket_addrs()
            .context(ConnectSnafu { address })?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no address resolved"))
            .context(ConnectSnafu { address })?;
        let socket = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        }
        .context(ConnectSnafu { address })?;

        let mut user_variables = vec![
            UserVariableItem::MaxLength(request.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        for role in request.contexts().iter().filter_map(|pc| pc.role.as_ref()) {
            user_variables.push(role.to_user_variable().context(RoleSelectionSnafu)?);
        }
        let rq = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: request.calling_ae_title.clone(),
            called_ae_title: request.called_ae_title.clone(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: request
                .contexts()
                .iter()
                .map(|pc| PresentationContextProposed {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntaxes: pc.transfer_syntaxes.clone(),
                })
                .collect(),
            user_variables,
        });

        let mut association = TcpAssociation {
            socket,
            state: AssociationState::Requesting,
            presentation_contexts: Vec::new(),
            max_pdu_length: request.max_pdu_length,
            peer_max_pdu_length: DEFAULT_MAX_PDU,
            strict,
            message_ids: MessageIdCounter::default(),
            partial: None,
        };
        association.send(&rq)?;
        let wait = if timeout.is_zero() { None } else { Some(timeout) };
        let pdu = association.receive(wait)?;

        match pdu {
            Pdu::AssociationAC(AssociationAC {
                presentation_contexts,
                user_variables,
                ..
            }) => {
                let roles = match decode_roles(&user_variables) {
                    Ok(roles) => roles,
                    Err(e) => {
                        if let Some(source) = e.abort_source() {
                            let _ = association.send(&Pdu::AbortRQ { source });
                        }
                        association.state = AssociationState::Aborted;
                        return Err(e).context(RoleSelectionSnafu);
                    }
                };
                association.peer_max_pdu_length = peer_max_length(&user_variables);
                association.presentation_contexts = presentation_contexts
                    .into_iter()
                    .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                    .filter_map(|pc| {
                        let proposed = request.context(pc.id)?;
                        let role = roles
                            .iter()
                            .find(|r| r.abstract_syntax == proposed.abstract_syntax);
                        Some(AcceptedContext {
                            id: pc.id,
                            abstract_syntax: proposed.abstract_syntax.clone(),
                            transfer_syntax: trim_uid(Cow::from(pc.transfer_syntax)).into_owned(),
                            scu: role.map(|r| r.scu).unwrap_or(true),
                            scp: role.map(|r| r.scp).unwrap_or(false),
                        })
                    })
                    .collect();
                if association.presentation_contexts.is_empty() {
                    let _ = association.send(&Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    });
                    association.state = AssociationState::Aborted;
                    return NoAcceptedPresentationContextsSnafu.fail();
                }
                association.state = AssociationState::Established;
                debug!(
                    "Association with {} established, {} presentation contexts accepted",
                    address,
                    association.presentation_contexts.len()
                );
                Ok(association)
            }
            Pdu::AssociationRJ(AssociationRJ { result, source }) => {
                association.state = AssociationState::Closed;
                RejectedSnafu {
                    reason: format!("{} ({:?})", source, result),
                }
                .fail()
            }
            pdu => {
                let _ = association.send(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                });
                association.state = AssociationState::Aborted;
                UnexpectedPduSnafu {
                    pdu: pdu_name(&pdu).to_string(),
                }
                .fail()
            }
        }
    }

    /// Negotiate an association requested by the peer on `socket`.
    pub fn accept(socket: TcpStream, options: &AcceptorOptions) -> Result<Self> {
        let mut association = TcpAssociation {
            socket,
            state: AssociationState::Accepting,
            presentation_contexts: Vec::new(),
            max_pdu_length: options.max_pdu_length,
            peer_max_pdu_length: DEFAULT_MAX_PDU,
            strict: options.strict,
            message_ids: MessageIdCounter::default(),
            partial: None,
        };
        let pdu = association.receive(options.read_timeout)?;
        let rq = match pdu {
            Pdu::AssociationRQ(rq) => rq,
            pdu => {
                let _ = association.send(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                });
                association.state = AssociationState::Aborted;
                return UnexpectedPduSnafu {
                    pdu: pdu_name(&pdu).to_string(),
                }
                .fail();
            }
        };

        let roles = match decode_roles(&rq.user_variables) {
            Ok(roles) => roles,
            Err(e) => {
                if let Some(source) = e.abort_source() {
                    let _ = association.send(&Pdu::AbortRQ { source });
                }
                association.state = AssociationState::Aborted;
                return Err(e).context(RoleSelectionSnafu);
            }
        };
        association.peer_max_pdu_length = peer_max_length(&rq.user_variables);

        let mut results = Vec::with_capacity(rq.presentation_contexts.len());
        for pc in &rq.presentation_contexts {
            let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str())).into_owned();
            let supported = options.promiscuous
                || options
                    .abstract_syntaxes
                    .iter()
                    .any(|uid| *uid == abstract_syntax);
            let transfer_syntax = options.transfer_syntaxes.iter().find(|ts| {
                pc.transfer_syntaxes
                    .iter()
                    .any(|proposed| trim_uid(Cow::from(proposed.as_str())) == ts.as_str())
            });
            let (reason, transfer_syntax) = match (supported, transfer_syntax) {
                (false, _) => (
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    pc.transfer_syntaxes.first().cloned().unwrap_or_default(),
                ),
                (true, None) => (
                    PresentationContextResultReason::TransferSyntaxesNotSupported,
                    pc.transfer_syntaxes.first().cloned().unwrap_or_default(),
                ),
                (true, Some(ts)) => {
                    let role = roles.iter().find(|r| r.abstract_syntax == abstract_syntax);
                    association.presentation_contexts.push(AcceptedContext {
                        id: pc.id,
                        abstract_syntax: abstract_syntax.clone(),
                        transfer_syntax: ts.clone(),
                        scu: role.map(|r| r.scu).unwrap_or(true),
                        scp: role.map(|r| r.scp).unwrap_or(false),
                    });
                    (PresentationContextResultReason::Acceptance, ts.clone())
                }
            };
            results.push(PresentationContextResult {
                id: pc.id,
                reason,
                transfer_syntax,
            });
        }

        if association.presentation_contexts.is_empty() {
            association.send(&Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven,
                ),
            }))?;
            association.state = AssociationState::Closed;
            let _ = association.socket.shutdown(Shutdown::Both);
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        let mut user_variables = vec![
            UserVariableItem::MaxLength(options.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        // accept every proposed role for the accepted abstract syntaxes
        for role in roles.iter().filter(|r| {
            association
                .presentation_contexts
                .iter()
                .any(|pc| pc.abstract_syntax == r.abstract_syntax)
        }) {
            user_variables.push(role.to_user_variable().context(RoleSelectionSnafu)?);
        }

        association.send(&Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: results,
            user_variables,
        }))?;
        association.state = AssociationState::Established;
        debug!(
            "Association with {} accepted, {} presentation contexts",
            rq.calling_ae_title.trim(),
            association.presentation_contexts.len()
        );
        Ok(association)
    }

    fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let mut buffer = Vec::new();
        write_pdu(&mut buffer, pdu).context(SendPduSnafu)?;
        self.socket.write_all(&buffer).context(WireSnafu)
    }

    /// Receive one PDU.
    ///
    /// The timeout bounds the whole PDU.
    /// If it expires before the first byte, the association stays usable.
    /// If it expires in the middle of a PDU, the association is aborted.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Pdu> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let max_pdu_length = self.max_pdu_length.min(MAXIMUM_PDU_SIZE);
        let mut consumed = 0;
        let mut pdu = vec![0u8; PDU_HEADER_LENGTH];
        if let Err(e) = self.fill(&mut pdu, deadline, &mut consumed) {
            return Err(self.read_failed(e, consumed));
        }
        let length = u32::from_be_bytes([pdu[2], pdu[3], pdu[4], pdu[5]]);
        let limit = if self.strict {
            max_pdu_length
        } else {
            MAXIMUM_PDU_SIZE
        };
        if length > limit {
            // the reader reports the length violation from the header alone
            return read_pdu(&mut &pdu[..], max_pdu_length, self.strict)
                .context(ReceivePduSnafu);
        }
        pdu.resize(PDU_HEADER_LENGTH + length as usize, 0);
        if let Err(e) = self.fill(&mut pdu[PDU_HEADER_LENGTH..], deadline, &mut consumed) {
            return Err(self.read_failed(e, consumed));
        }
        read_pdu(&mut &pdu[..], max_pdu_length, self.strict).context(ReceivePduSnafu)
    }

    /// Fill `buf` from the socket before `deadline`,
    /// counting the bytes taken from the stream in `consumed`.
    fn fill(
        &mut self,
        buf: &mut [u8],
        deadline: Option<Instant>,
        consumed: &mut usize,
    ) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            // a zero read timeout is refused by the socket
            let timeout = deadline.map(|deadline| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(1))
            });
            self.socket.set_read_timeout(timeout)?;
            match self.socket.read(&mut buf[filled..]) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    filled += n;
                    *consumed += n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Turn a failed socket read into an association error.
    fn read_failed(&mut self, e: std::io::Error, consumed: usize) -> Error {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut if consumed == 0 => TimeoutSnafu.build(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                warn!("Timed out after {} bytes of a PDU, aborting association", consumed);
                self.abort();
                TimeoutSnafu.build()
            }
            ErrorKind::UnexpectedEof if consumed == 0 => {
                self.state = AssociationState::Closed;
                ClosedSnafu.build()
            }
            _ => {
                if consumed > 0 {
                    self.abort();
                }
                WireSnafu.into_error(e)
            }
        }
    }

    /// Send an A-ABORT and drop the connection.
    fn abort(&mut self) {
        let _ = self.send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });
        self.state = AssociationState::Aborted;
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Send the fragments of one part of a message.
    fn send_fragments(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
        data: &[u8],
    ) -> Result<()> {
        let mut writer = PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            value_type,
            self.peer_max_pdu_length,
        );
        writer.write_all(data).context(WireSnafu)?;
        writer.finish().context(WireSnafu)
    }

    /// Turn a fully received message into a DIMSE message.
    fn complete(&self, partial: PartialMessage) -> Result<DimseMessage> {
        let id = partial.presentation_context_id;
        let pc = self
            .presentation_contexts
            .iter()
            .find(|pc| pc.id == id)
            .context(UnknownPresentationContextSnafu { id })?;
        let command = codec::read_command(&partial.command[..]).context(CodecSnafu)?;
        let stream: Option<Box<dyn std::io::Read + Send>> = if partial.data_complete {
            Some(Box::new(Cursor::new(partial.data)))
        } else {
            None
        };
        Ok(DimseMessage::inbound(
            id,
            Some(pc.transfer_syntax.clone()),
            command,
            stream,
        ))
    }

    fn ensure_established(&self) -> Result<()> {
        ensure!(
            self.state == AssociationState::Established,
            InvalidStateSnafu { state: self.state }
        );
        Ok(())
    }
}

impl Association for TcpAssociation {
    fn state(&self) -> AssociationState {
        self.state
    }

    fn presentation_contexts(&self) -> &[AcceptedContext] {
        &self.presentation_contexts
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_ids.next()
    }

    fn current_message_id(&self) -> u16 {
        self.message_ids.current()
    }

    fn read(&mut self, timeout: Duration) -> Result<DimseMessage> {
        ensure!(
            matches!(
                self.state,
                AssociationState::Established | AssociationState::Releasing
            ),
            InvalidStateSnafu { state: self.state }
        );
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receive(Some(remaining))? {
                Pdu::PData { data } => {
                    for pdv in data {
                        let partial = self.partial.get_or_insert_with(|| PartialMessage {
                            presentation_context_id: pdv.presentation_context_id,
                            ..Default::default()
                        });
                        if partial.presentation_context_id != pdv.presentation_context_id {
                            let expected = partial.presentation_context_id;
                            warn!(
                                "Fragment for presentation context {} interleaved with a message on {}",
                                pdv.presentation_context_id, expected
                            );
                            self.partial = None;
                            self.abort();
                            return MixedPresentationContextsSnafu {
                                expected,
                                got: pdv.presentation_context_id,
                            }
                            .fail();
                        }
                        match pdv.value_type {
                            PDataValueType::Command => {
                                partial.command.extend(pdv.data);
                                partial.command_complete |= pdv.is_last;
                            }
                            PDataValueType::Data => {
                                partial.data.extend(pdv.data);
                                partial.data_complete |= pdv.is_last;
                            }
                        }
                    }
                    let ready = match &self.partial {
                        Some(p) if p.command_complete && p.data_complete => true,
                        Some(p) if p.command_complete => {
                            // complete unless the command announces a data set
                            let command =
                                codec::read_command(&p.command[..]).context(CodecSnafu)?;
                            !DimseMessage::inbound(p.presentation_context_id, None, command, None)
                                .has_dataset()
                        }
                        _ => false,
                    };
                    if ready {
                        if let Some(partial) = self.partial.take() {
                            return self.complete(partial);
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    debug!("Peer requested release");
                    self.send(&Pdu::ReleaseRP)?;
                    self.state = AssociationState::Closed;
                    let _ = self.socket.shutdown(Shutdown::Both);
                    return ClosedSnafu.fail();
                }
                Pdu::ReleaseRP if self.state == AssociationState::Releasing => {
                    self.state = AssociationState::Closed;
                    let _ = self.socket.shutdown(Shutdown::Both);
                    return ClosedSnafu.fail();
                }
                Pdu::AbortRQ { source } => {
                    warn!("Association aborted by peer: {:?}", source);
                    self.state = AssociationState::Aborted;
                    let _ = self.socket.shutdown(Shutdown::Both);
                    return AbortedSnafu.fail();
                }
                pdu => {
                    self.abort();
                    return UnexpectedPduSnafu {
                        pdu: pdu_name(&pdu).to_string(),
                    }
                    .fail();
                }
            }
        }
    }

    fn write(&mut self, message: &mut DimseMessage) -> Result<()> {
        self.ensure_established()?;
        let id = message.presentation_context_id();
        let transfer_syntax = self
            .presentation_contexts
            .iter()
            .find(|pc| pc.id == id)
            .map(|pc| pc.transfer_syntax.clone())
            .context(UnknownPresentationContextSnafu { id })?;

        let mut command = Vec::new();
        codec::write_command(message.command(), &mut command).context(CodecSnafu)?;
        self.send_fragments(id, PDataValueType::Command, &command)?;

        if message.has_dataset() {
            let mut writer = PDataWriter::new(
                &mut self.socket,
                id,
                PDataValueType::Data,
                self.peer_max_pdu_length,
            );
            message
                .write_to(&mut writer, &transfer_syntax)
                .context(MessageSnafu)?;
            writer.finish().context(WireSnafu)?;
        }
        debug!("Sent {}", message);
        Ok(())
    }

    fn write_release_request(&mut self) -> Result<()> {
        self.ensure_established()?;
        self.send(&Pdu::ReleaseRQ)?;
        self.state = AssociationState::Releasing;
        Ok(())
    }

    fn release(&mut self, mode: ReleaseMode) -> Result<()> {
        match (mode, self.state) {
            (_, AssociationState::Closed | AssociationState::Aborted) => Ok(()),
            (ReleaseMode::Abort, _) => {
                let out = self.send(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                });
                self.state = AssociationState::Aborted;
                let _ = self.socket.shutdown(Shutdown::Both);
                out
            }
            (ReleaseMode::Graceful, _) => {
                if self.state == AssociationState::Established {
                    self.send(&Pdu::ReleaseRQ)?;
                    self.state = AssociationState::Releasing;
                }
                let deadline = Instant::now() + RELEASE_TIMEOUT;
                let out = loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.receive(Some(remaining)) {
                        Ok(Pdu::ReleaseRP) => break Ok(()),
                        // late fragments of an abandoned exchange
                        Ok(Pdu::PData { .. }) => continue,
                        Ok(Pdu::ReleaseRQ) => {
                            // release collision
                            let _ = self.send(&Pdu::ReleaseRP);
                            break Ok(());
                        }
                        Ok(Pdu::AbortRQ { .. }) => break AbortedSnafu.fail(),
                        Ok(pdu) => {
                            break UnexpectedPduSnafu {
                                pdu: pdu_name(&pdu).to_string(),
                            }
                            .fail()
                        }
                        Err(e) => break Err(e),
                    }
                };
                self.state = AssociationState::Closed;
                let _ = self.socket.shutdown(Shutdown::Both);
                out
            }
        }
    }
}

impl Drop for TcpAssociation {
    fn drop(&mut self) {
        if matches!(
            self.state,
            AssociationState::Established | AssociationState::Releasing
        ) {
            let _ = self.release(ReleaseMode::Graceful);
        }
    }
}

/// Collect the role selection sub-items among the user variables.
fn decode_roles(
    user_variables: &[UserVariableItem],
) -> Result<Vec<RoleSelection>, crate::role_selection::Error> {
    user_variables
        .iter()
        .filter_map(RoleSelection::from_user_variable)
        .collect()
}

/// A short name of the PDU for diagnostics.
fn pdu_name(pdu: &Pdu) -> &'static str {
    match pdu {
        Pdu::AssociationRQ(_) => "A-ASSOCIATE-RQ",
        Pdu::AssociationAC(_) => "A-ASSOCIATE-AC",
        Pdu::AssociationRJ(_) => "A-ASSOCIATE-RJ",
        Pdu::PData { .. } => "P-DATA-TF",
        Pdu::ReleaseRQ => "A-RELEASE-RQ",
        Pdu::ReleaseRP => "A-RELEASE-RP",
        Pdu::AbortRQ { .. } => "A-ABORT-RQ",
        _ => "unknown PDU",
    }
}

/// The maximum PDU length announced by the peer.
fn peer_max_length(user_variables: &[UserVariableItem]) -> u32 {
    user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        // 0 means unlimited
        .map(|len| if len == 0 { MAXIMUM_PDU_SIZE } else { len })
        .unwrap_or(DEFAULT_MAX_PDU)
}
