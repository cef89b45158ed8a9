//! Request/response correlation on an established association.
//!
//! An [`ActiveAssociation`] hands its association to a reader thread,
//! which is the only one to drive it.
//! Callers submit requests to the thread
//! and block on a [`ResponseFuture`]
//! until the final response of their exchange arrives.
//! Responses are routed by their "message id being responded to".
use dicom_object::InMemDicomObject;
use dimse_ul::association::{self, AcceptedContext, Association, ReleaseMode};
use dimse_ul::command::{self, CommandField};
use dimse_ul::status::{self, StatusKind};
use dimse_ul::DimseMessage;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// could not start the association reader
    SpawnReader { source: std::io::Error },

    /// association failed
    Association { source: association::Error },

    #[snafu(display("association ended before the exchange completed: {}", reason))]
    Interrupted { reason: String, backtrace: Backtrace },

    #[snafu(display("no response to message #{} within {:?}", message_id, timeout))]
    ResponseTimeout {
        message_id: u16,
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("association reader did not stop within {:?}", timeout))]
    ReleaseTimeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("{} without message id being responded to", field))]
    MissingResponseId {
        field: CommandField,
        backtrace: Backtrace,
    },

    #[snafu(display("response to unknown message #{}", message_id))]
    UnknownResponse {
        message_id: u16,
        backtrace: Backtrace,
    },

    /// could not answer a C-STORE sub-operation
    AnswerStore { source: association::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds the message to send, given its message id.
type Build = Box<dyn FnOnce(u16) -> DimseMessage + Send>;

enum Request {
    Invoke {
        build: Build,
        responses: Option<Sender<Delivery>>,
        sent: Sender<Result<u16>>,
    },
    WriteReleaseRequest {
        ack: Sender<Result<()>>,
    },
    Release {
        mode: ReleaseMode,
        ack: Sender<Result<()>>,
    },
}

enum Delivery {
    Response(DimseMessage),
    Failed(Error),
}

/// The responses of one completed exchange.
#[derive(Debug)]
pub struct Responses {
    /// the pending responses, in order of arrival
    pub pending: Vec<DimseMessage>,
    /// the final response
    pub last: DimseMessage,
}

impl Responses {
    /// The status of the final response.
    pub fn status(&self) -> Option<u16> {
        self.last.status()
    }

    pub fn status_kind(&self) -> StatusKind {
        self.status()
            .map(StatusKind::of)
            .unwrap_or(StatusKind::Failure)
    }

    /// Whether the exchange ended with success or a warning.
    pub fn is_success(&self) -> bool {
        matches!(self.status_kind(), StatusKind::Success | StatusKind::Warning)
    }
}

/// The pending outcome of a request.
#[derive(Debug)]
pub struct ResponseFuture {
    message_id: u16,
    responses: Receiver<Delivery>,
    timeout: Duration,
}

impl ResponseFuture {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Block until the final response arrives.
    ///
    /// Each response must arrive within the response timeout
    /// of the previous one.
    pub fn wait(self) -> Result<Responses> {
        let mut pending = Vec::new();
        loop {
            match self.responses.recv_timeout(self.timeout) {
                Ok(Delivery::Response(message)) => {
                    if message.status().map(StatusKind::of) == Some(StatusKind::Pending) {
                        pending.push(message);
                    } else {
                        return Ok(Responses {
                            pending,
                            last: message,
                        });
                    }
                }
                Ok(Delivery::Failed(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    return ResponseTimeoutSnafu {
                        message_id: self.message_id,
                        timeout: self.timeout,
                    }
                    .fail()
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return InterruptedSnafu {
                        reason: "association reader stopped",
                    }
                    .fail()
                }
            }
        }
    }
}

/// An association driven by a dedicated reader thread.
#[derive(Debug)]
pub struct ActiveAssociation {
    requests: Sender<Request>,
    reader: Mutex<Option<JoinHandle<()>>>,
    contexts: Vec<AcceptedContext>,
    current_message_id: Arc<AtomicU16>,
    received: Arc<Mutex<Vec<InMemDicomObject>>>,
    response_timeout: Duration,
}

impl ActiveAssociation {
    /// Start the reader thread of an established association.
    ///
    /// The reader waits at most `poll_interval` for the peer
    /// before serving requests again.
    pub fn start(
        association: Box<dyn Association>,
        poll_interval: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        let contexts = association.presentation_contexts().to_vec();
        let current_message_id = Arc::new(AtomicU16::new(association.current_message_id()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (requests, inbox) = mpsc::channel();

        let reader = Reader {
            association,
            inbox,
            pending: HashMap::new(),
            current_message_id: Arc::clone(&current_message_id),
            received: Arc::clone(&received),
            poll_interval,
        };
        let handle = thread::Builder::new()
            .name("association-reader".to_string())
            .spawn(move || reader.run())
            .map_err(|source| Error::SpawnReader { source })?;

        Ok(ActiveAssociation {
            requests,
            reader: Mutex::new(Some(handle)),
            contexts,
            current_message_id,
            received,
            response_timeout,
        })
    }

    pub fn presentation_contexts(&self) -> &[AcceptedContext] {
        &self.contexts
    }

    pub fn accepted_context(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
    ) -> Option<&AcceptedContext> {
        self.contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax && pc.transfer_syntax == transfer_syntax)
    }

    pub fn accepted_context_by_id(&self, id: u8) -> Option<&AcceptedContext> {
        self.contexts.iter().find(|pc| pc.id == id)
    }

    /// The id of the most recently sent request.
    pub fn current_message_id(&self) -> u16 {
        self.current_message_id.load(Ordering::SeqCst)
    }

    /// Send a request and expect responses to it.
    pub fn invoke<F>(&self, build: F) -> Result<ResponseFuture>
    where
        F: FnOnce(u16) -> DimseMessage + Send + 'static,
    {
        let (responses, receiver) = mpsc::channel();
        let message_id = self.submit(Box::new(build), Some(responses))?;
        Ok(ResponseFuture {
            message_id,
            responses: receiver,
            timeout: self.response_timeout,
        })
    }

    /// Send a request without expecting any response.
    pub fn send<F>(&self, build: F) -> Result<u16>
    where
        F: FnOnce(u16) -> DimseMessage + Send + 'static,
    {
        self.submit(Box::new(build), None)
    }

    fn submit(&self, build: Build, responses: Option<Sender<Delivery>>) -> Result<u16> {
        let (sent, outcome) = mpsc::channel();
        self.requests
            .send(Request::Invoke {
                build,
                responses,
                sent,
            })
            .map_err(|_| stopped())?;
        outcome.recv().map_err(|_| stopped())?
    }

    /// Send an A-RELEASE-RQ without waiting for the reply.
    ///
    /// Exchanges still in progress fail once the peer replies.
    pub fn write_release_request(&self) -> Result<()> {
        let (ack, outcome) = mpsc::channel();
        self.requests
            .send(Request::WriteReleaseRequest { ack })
            .map_err(|_| stopped())?;
        outcome.recv().map_err(|_| stopped())?
    }

    /// End the association and stop the reader.
    ///
    /// Releasing an association which already ended succeeds.
    /// A reader which does not stop within the response timeout
    /// is left behind.
    pub fn release(&self, mode: ReleaseMode) -> Result<()> {
        let (ack, outcome) = mpsc::channel();
        if self.requests.send(Request::Release { mode, ack }).is_err() {
            self.join_reader();
            return Ok(());
        }
        match outcome.recv_timeout(self.response_timeout) {
            Ok(out) => {
                self.join_reader();
                out
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.join_reader();
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Association reader did not stop within {:?}, detaching it",
                    self.response_timeout
                );
                self.reader
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                ReleaseTimeoutSnafu {
                    timeout: self.response_timeout,
                }
                .fail()
            }
        }
    }

    /// Take the instances received through C-STORE sub-operations so far.
    pub fn take_received(&self) -> Vec<InMemDicomObject> {
        let mut received = self.received.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *received)
    }

    fn join_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Association reader panicked");
            }
        }
    }
}

impl Drop for ActiveAssociation {
    fn drop(&mut self) {
        let running = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if running {
            let _ = self.release(ReleaseMode::Graceful);
        }
    }
}

fn stopped() -> Error {
    InterruptedSnafu {
        reason: "association reader stopped",
    }
    .build()
}

/// The state owned by the reader thread.
struct Reader {
    association: Box<dyn Association>,
    inbox: Receiver<Request>,
    pending: HashMap<u16, Sender<Delivery>>,
    current_message_id: Arc<AtomicU16>,
    received: Arc<Mutex<Vec<InMemDicomObject>>>,
    poll_interval: Duration,
}

impl Reader {
    fn run(mut self) {
        loop {
            if !self.serve_requests() {
                return;
            }
            match self.association.read(self.poll_interval) {
                Ok(message) => {
                    if let Err(e) = self.dispatch(message) {
                        warn!("Protocol error: {}", e);
                        self.fail_all(&e.to_string());
                        let _ = self.association.release(ReleaseMode::Abort);
                        return;
                    }
                }
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    debug!("Association ended: {}", e);
                    self.fail_all(&e.to_string());
                    return;
                }
            }
        }
    }

    /// Serve the requests submitted so far.
    ///
    /// Returns false once the reader must stop.
    fn serve_requests(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(Request::Invoke {
                    build,
                    responses,
                    sent,
                }) => {
                    let message_id = self.association.next_message_id();
                    self.current_message_id.store(message_id, Ordering::SeqCst);
                    let mut message = build(message_id);
                    if let Some(responses) = responses {
                        // registered before sending, so no response can be missed
                        self.pending.insert(message_id, responses);
                    }
                    let outcome = match self.association.write(&mut message) {
                        Ok(()) => Ok(message_id),
                        Err(source) => {
                            self.pending.remove(&message_id);
                            Err(Error::Association { source })
                        }
                    };
                    let _ = sent.send(outcome);
                }
                Ok(Request::WriteReleaseRequest { ack }) => {
                    let outcome = self
                        .association
                        .write_release_request()
                        .map_err(|source| Error::Association { source });
                    let _ = ack.send(outcome);
                }
                Ok(Request::Release { mode, ack }) => {
                    let outcome = self
                        .association
                        .release(mode)
                        .map_err(|source| Error::Association { source });
                    self.fail_all("association released");
                    let _ = ack.send(outcome);
                    return false;
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    let _ = self.association.release(ReleaseMode::Graceful);
                    self.fail_all("association released");
                    return false;
                }
            }
        }
    }

    /// Route an inbound message.
    fn dispatch(&mut self, mut message: DimseMessage) -> Result<()> {
        match message.command_field() {
            Some(CommandField::CStoreRq) => self.accept_store(&mut message),
            Some(field) if field.is_response() => {
                let message_id = message
                    .message_id_being_responded_to()
                    .context(MissingResponseIdSnafu { field })?;
                let responses = self
                    .pending
                    .get(&message_id)
                    .context(UnknownResponseSnafu { message_id })?;
                let is_final = message
                    .status()
                    .map(|s| StatusKind::of(s).is_final())
                    .unwrap_or(true);
                debug!("Received {}", message);
                // the waiter may have given up already
                let _ = responses.send(Delivery::Response(message));
                if is_final {
                    self.pending.remove(&message_id);
                }
                Ok(())
            }
            _ => {
                warn!("Ignoring unexpected request {}", message);
                Ok(())
            }
        }
    }

    /// Answer a C-STORE sub-operation, keeping the instance.
    fn accept_store(&mut self, message: &mut DimseMessage) -> Result<()> {
        let message_id = message.message_id().unwrap_or_default();
        let sop_class_uid = message.affected_sop_class_uid().unwrap_or_default();
        let sop_instance_uid = message.affected_sop_instance_uid().unwrap_or_default();
        let (status, comment) = match message.take_dataset() {
            Ok(Some(dataset)) => {
                debug!("Received instance {}", sop_instance_uid);
                self.received
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(dataset);
                (status::SUCCESS, None)
            }
            Ok(None) => (status::CANNOT_UNDERSTAND, Some("missing data set".to_string())),
            Err(e) => {
                warn!("Could not decode instance {}: {}", sop_instance_uid, e);
                (status::CANNOT_UNDERSTAND, Some(e.to_string()))
            }
        };
        let mut response = DimseMessage::command_only(
            message.presentation_context_id(),
            command::store_rsp(
                message_id,
                &sop_class_uid,
                &sop_instance_uid,
                status,
                comment.as_deref(),
            ),
        );
        self.association
            .write(&mut response)
            .context(AnswerStoreSnafu)
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, responses) in self.pending.drain() {
            let _ = responses.send(Delivery::Failed(
                InterruptedSnafu {
                    reason: reason.to_string(),
                }
                .build(),
            ));
        }
    }
}
