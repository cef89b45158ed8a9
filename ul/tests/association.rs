use dicom_dictionary_std::uids;
use dicom_ul::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRQ, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
};
use dimse_ul::association::{
    propose_context, AcceptorOptions, Error, TcpAssociation, TcpConnector,
};
use dimse_ul::command::{self, CommandField};
use dimse_ul::role_selection::ITEM_TYPE;
use dimse_ul::{
    status, Association, AssociationRequest, AssociationState, Connector, DimseMessage,
    ReleaseMode, RoleSelection,
};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

const TIMEOUT: Duration = Duration::from_secs(5);

fn acceptor_options() -> AcceptorOptions {
    AcceptorOptions {
        ae_title: "ECHO-SCP".to_string(),
        abstract_syntaxes: vec![
            uids::VERIFICATION.to_string(),
            uids::CT_IMAGE_STORAGE.to_string(),
        ],
        transfer_syntaxes: vec![
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        ],
        ..Default::default()
    }
}

/// Accept one association and answer C-ECHO requests until it ends.
fn spawn_echo_scp() -> Result<(JoinHandle<Result<AssociationState>>, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || -> Result<AssociationState> {
        let (socket, _) = listener.accept()?;
        let mut association = TcpAssociation::accept(socket, &acceptor_options())?;
        loop {
            match association.read(TIMEOUT) {
                Ok(request) => {
                    assert_eq!(request.command_field(), Some(CommandField::CEchoRq));
                    let id = request.message_id().unwrap_or_default();
                    let mut response = DimseMessage::command_only(
                        request.presentation_context_id(),
                        command::echo_rsp(id, status::SUCCESS),
                    );
                    association.write(&mut response)?;
                }
                Err(Error::Closed { .. }) => return Ok(association.state()),
                Err(e) => return Err(e.into()),
            }
        }
    });
    Ok((handle, addr))
}

/// Accept one association on a raw socket,
/// then hand the socket over to `then`.
fn spawn_raw_scp<F>(then: F) -> Result<(JoinHandle<Result<()>>, SocketAddr)>
where
    F: FnOnce(TcpStream) -> Result<()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || -> Result<()> {
        let (mut socket, _) = listener.accept()?;
        let rq = match read_pdu(&mut socket, 16384, true)? {
            Pdu::AssociationRQ(rq) => rq,
            pdu => return Err(format!("unexpected {:?}", pdu).into()),
        };
        let ac = Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: rq
                .presentation_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: pc.transfer_syntaxes[0].clone(),
                })
                .collect(),
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        });
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &ac)?;
        socket.write_all(&bytes)?;
        then(socket)
    });
    Ok((handle, addr))
}

fn echo_request() -> Result<AssociationRequest> {
    let mut request = AssociationRequest::new("ECHO-SCU", "ECHO-SCP");
    request.add_context(propose_context(
        1,
        uids::VERIFICATION,
        [uids::IMPLICIT_VR_LITTLE_ENDIAN],
        None,
    ))?;
    Ok(request)
}

#[test]
fn echo_over_loopback() -> Result<()> {
    let (scp, addr) = spawn_echo_scp()?;

    let mut request = AssociationRequest::new("ECHO-SCU", "ECHO-SCP");
    request.add_context(propose_context(
        1,
        uids::VERIFICATION,
        [uids::IMPLICIT_VR_LITTLE_ENDIAN],
        None,
    ))?;
    request.add_context(propose_context(
        3,
        uids::CT_IMAGE_STORAGE,
        [uids::IMPLICIT_VR_LITTLE_ENDIAN],
        Some(RoleSelection::new(uids::CT_IMAGE_STORAGE, false, true)),
    ))?;
    // not supported by the acceptor
    request.add_context(propose_context(
        5,
        uids::MR_IMAGE_STORAGE,
        [uids::IMPLICIT_VR_LITTLE_ENDIAN],
        None,
    ))?;

    let mut association = TcpConnector::new(addr.to_string()).connect(&request, TIMEOUT)?;
    assert_eq!(association.state(), AssociationState::Established);
    assert_eq!(association.presentation_contexts().len(), 2);
    let echo = association
        .accepted_transfer_syntax(uids::VERIFICATION)
        .cloned()
        .expect("verification accepted");
    assert_eq!(echo.transfer_syntax, uids::IMPLICIT_VR_LITTLE_ENDIAN);
    assert!(echo.scu && !echo.scp);
    let storage = association
        .accepted_context_by_id(3)
        .expect("storage accepted");
    assert!(!storage.scu && storage.scp);
    assert!(association.accepted_context_by_id(5).is_none());

    for _ in 0..2 {
        let id = association.next_message_id();
        let mut rq = DimseMessage::command_only(echo.id, command::echo_rq(id));
        association.write(&mut rq)?;
        let rsp = association.read(TIMEOUT)?;
        assert_eq!(rsp.command_field(), Some(CommandField::CEchoRsp));
        assert_eq!(rsp.message_id_being_responded_to(), Some(id));
        assert_eq!(rsp.status(), Some(status::SUCCESS));
    }
    assert_eq!(association.current_message_id(), 2);

    association.release(ReleaseMode::Graceful)?;
    assert_eq!(association.state(), AssociationState::Closed);
    let scp_state = scp.join().expect("SCP thread panicked")?;
    assert_eq!(scp_state, AssociationState::Closed);
    Ok(())
}

#[test]
fn read_times_out_without_losing_the_association() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let scp = thread::spawn(move || -> Result<()> {
        let (socket, _) = listener.accept()?;
        let mut association = TcpAssociation::accept(socket, &acceptor_options())?;
        // stay silent until the peer releases
        match association.read(TIMEOUT) {
            Err(Error::Closed { .. }) => Ok(()),
            other => Err(format!("unexpected outcome {:?}", other.map(|m| m.to_string())).into()),
        }
    });

    let mut request = AssociationRequest::new("ECHO-SCU", "ECHO-SCP");
    request.add_context(propose_context(
        1,
        uids::VERIFICATION,
        [uids::IMPLICIT_VR_LITTLE_ENDIAN],
        None,
    ))?;
    let mut association = TcpConnector::new(addr.to_string()).connect(&request, TIMEOUT)?;
    let err = association
        .read(Duration::from_millis(50))
        .expect_err("nothing to read");
    assert!(err.is_timeout());
    assert_eq!(association.state(), AssociationState::Established);

    association.release(ReleaseMode::Graceful)?;
    scp.join().expect("SCP thread panicked")?;
    Ok(())
}

#[test]
fn unsupported_abstract_syntaxes_are_rejected() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let scp = thread::spawn(move || {
        let (socket, _) = listener.accept().expect("accept");
        TcpAssociation::accept(socket, &acceptor_options()).map(|_| ())
    });

    let mut request = AssociationRequest::new("ECHO-SCU", "ECHO-SCP");
    request.add_context(propose_context(
        1,
        uids::MR_IMAGE_STORAGE,
        [uids::IMPLICIT_VR_LITTLE_ENDIAN],
        None,
    ))?;
    let err = TcpConnector::new(addr.to_string())
        .connect(&request, TIMEOUT)
        .expect_err("association should be rejected");
    assert!(matches!(err, Error::Rejected { .. }), "got {}", err);

    let scp_outcome = scp.join().expect("SCP thread panicked");
    assert!(matches!(
        scp_outcome,
        Err(Error::NoAcceptedPresentationContexts { .. })
    ));
    Ok(())
}

#[test]
fn inconsistent_role_selection_aborts() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let scp = thread::spawn(move || {
        let (socket, _) = listener.accept().expect("accept");
        TcpAssociation::accept(socket, &acceptor_options()).map(|_| ())
    });

    let mut socket = TcpStream::connect(addr)?;
    let rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "ECHO-SCU".to_string(),
        called_ae_title: "ECHO-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: uids::VERIFICATION.to_string(),
            transfer_syntaxes: vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            // declares a 9-byte UID in a 7-byte item
            UserVariableItem::Unknown(ITEM_TYPE, vec![0x00, 0x09, b'1', b'.', b'2', 0x01, 0x00]),
        ],
    });
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &rq)?;
    socket.write_all(&bytes)?;

    let reply = read_pdu(&mut socket, 16384, true)?;
    assert!(matches!(
        reply,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter
            )
        }
    ));
    let scp_outcome = scp.join().expect("SCP thread panicked");
    assert!(matches!(scp_outcome, Err(Error::RoleSelection { .. })));
    Ok(())
}

#[test]
fn read_timeout_in_the_middle_of_a_pdu_aborts() -> Result<()> {
    let (done, wait_done) = mpsc::channel::<()>();
    let (scp, addr) = spawn_raw_scp(move |mut socket| {
        // a P-DATA-TF header announcing 16 bytes which never come
        socket.write_all(&[0x04, 0x00, 0x00, 0x00, 0x00, 0x10])?;
        let _ = wait_done.recv_timeout(TIMEOUT);
        Ok(())
    })?;

    let mut association = TcpConnector::new(addr.to_string()).connect(&echo_request()?, TIMEOUT)?;
    let started = Instant::now();
    let err = association
        .read(Duration::from_millis(200))
        .expect_err("the PDU is never completed");
    assert!(err.is_timeout(), "got {}", err);
    assert!(started.elapsed() < TIMEOUT);
    // the rest of the stream cannot be framed anymore
    assert_eq!(association.state(), AssociationState::Aborted);

    let _ = done.send(());
    scp.join().expect("SCP thread panicked")?;
    Ok(())
}

#[test]
fn fragments_of_another_presentation_context_abort() -> Result<()> {
    let (scp, addr) = spawn_raw_scp(|mut socket| {
        let pdata = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: false,
                    data: vec![0x00; 8],
                },
                PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![0x00; 8],
                },
            ],
        };
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &pdata)?;
        socket.write_all(&bytes)?;
        match read_pdu(&mut socket, 16384, true)? {
            Pdu::AbortRQ { .. } => Ok(()),
            pdu => Err(format!("expected an abort, got {:?}", pdu).into()),
        }
    })?;

    let mut request = echo_request()?;
    request.add_context(propose_context(
        3,
        uids::CT_IMAGE_STORAGE,
        [uids::IMPLICIT_VR_LITTLE_ENDIAN],
        None,
    ))?;
    let mut association = TcpConnector::new(addr.to_string()).connect(&request, TIMEOUT)?;
    let err = association
        .read(TIMEOUT)
        .expect_err("interleaved fragments");
    assert!(
        matches!(
            err,
            Error::MixedPresentationContexts {
                expected: 1,
                got: 3,
                ..
            }
        ),
        "got {}",
        err
    );
    assert_eq!(association.state(), AssociationState::Aborted);
    scp.join().expect("SCP thread panicked")?;
    Ok(())
}

#[test]
fn silent_peer_times_out_the_acceptor() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let _client = TcpStream::connect(addr)?;
    let (socket, _) = listener.accept()?;

    let options = AcceptorOptions {
        read_timeout: Some(Duration::from_millis(200)),
        ..acceptor_options()
    };
    let started = Instant::now();
    let err = TcpAssociation::accept(socket, &options).expect_err("no association request");
    assert!(err.is_timeout(), "got {}", err);
    assert!(started.elapsed() < TIMEOUT);
    Ok(())
}
