//! Scripted associations for exercising the service class user
//! without a network peer.
#![allow(dead_code)]

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse_ul::association::{
    self, AcceptedContext, Association, AssociationRequest, AssociationState, ClosedSnafu,
    Connector, MessageIdCounter, MessageSnafu, ReleaseMode, TimeoutSnafu,
};
use dimse_ul::command::CommandField;
use dimse_ul::{codec, DimseMessage};
use snafu::ResultExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A message written by the service class user.
#[derive(Debug, Clone)]
pub struct Written {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub dataset: Option<InMemDicomObject>,
}

impl Written {
    pub fn command_field(&self) -> Option<CommandField> {
        CommandField::from_code(u16_of(&self.command, tags::COMMAND_FIELD)?)
    }

    pub fn message_id(&self) -> Option<u16> {
        u16_of(&self.command, tags::MESSAGE_ID)
    }
}

/// A request as seen by the scripted peer.
pub struct Exchange<'a> {
    pub contexts: &'a [AcceptedContext],
    pub written: &'a Written,
}

impl Exchange<'_> {
    pub fn message_id(&self) -> u16 {
        self.written.message_id().unwrap_or_default()
    }

    pub fn command_field(&self) -> Option<CommandField> {
        self.written.command_field()
    }

    /// The id of the accepted context for an abstract syntax.
    pub fn context_for(&self, abstract_syntax: &str) -> Option<u8> {
        self.contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
            .map(|pc| pc.id)
    }
}

/// A message sent back by the scripted peer.
pub struct Reply {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub dataset: Option<InMemDicomObject>,
}

type Responder = Arc<dyn Fn(&Exchange<'_>) -> Vec<Reply> + Send + Sync>;

/// A connector to a scripted peer,
/// counting the associations opened.
pub struct FakeConnector {
    opens: AtomicUsize,
    requests: Mutex<Vec<AssociationRequest>>,
    written: Arc<Mutex<Vec<Written>>>,
    releases: Arc<Mutex<Vec<ReleaseMode>>>,
    responder: Responder,
}

impl FakeConnector {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&Exchange<'_>) -> Vec<Reply> + Send + Sync + 'static,
    {
        Arc::new(FakeConnector {
            opens: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            written: Arc::new(Mutex::new(Vec::new())),
            releases: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AssociationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<Written> {
        self.written.lock().unwrap().clone()
    }

    pub fn written_with(&self, field: CommandField) -> Vec<Written> {
        self.written()
            .into_iter()
            .filter(|w| w.command_field() == Some(field))
            .collect()
    }

    pub fn releases(&self) -> Vec<ReleaseMode> {
        self.releases.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        request: &AssociationRequest,
        _timeout: Duration,
    ) -> association::Result<Box<dyn Association>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let contexts = request
            .contexts()
            .iter()
            .map(|pc| AcceptedContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntax: pc.transfer_syntaxes[0].clone(),
                scu: pc.role.as_ref().map(|r| r.scu).unwrap_or(true),
                scp: pc.role.as_ref().map(|r| r.scp).unwrap_or(false),
            })
            .collect();
        Ok(Box::new(FakeAssociation {
            state: AssociationState::Established,
            contexts,
            message_ids: MessageIdCounter::default(),
            inbox: VecDeque::new(),
            written: Arc::clone(&self.written),
            releases: Arc::clone(&self.releases),
            responder: Arc::clone(&self.responder),
        }))
    }
}

struct FakeAssociation {
    state: AssociationState,
    contexts: Vec<AcceptedContext>,
    message_ids: MessageIdCounter,
    inbox: VecDeque<DimseMessage>,
    written: Arc<Mutex<Vec<Written>>>,
    releases: Arc<Mutex<Vec<ReleaseMode>>>,
    responder: Responder,
}

impl Association for FakeAssociation {
    fn state(&self) -> AssociationState {
        self.state
    }

    fn presentation_contexts(&self) -> &[AcceptedContext] {
        &self.contexts
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_ids.next()
    }

    fn current_message_id(&self) -> u16 {
        self.message_ids.current()
    }

    fn read(&mut self, timeout: Duration) -> association::Result<DimseMessage> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(message);
        }
        match self.state {
            AssociationState::Established => {
                thread::sleep(timeout.min(Duration::from_millis(5)));
                TimeoutSnafu.fail()
            }
            _ => {
                self.state = AssociationState::Closed;
                ClosedSnafu.fail()
            }
        }
    }

    fn write(&mut self, message: &mut DimseMessage) -> association::Result<()> {
        let presentation_context_id = message.presentation_context_id();
        let dataset = if message.has_dataset() {
            let transfer_syntax = self
                .contexts
                .iter()
                .find(|pc| pc.id == presentation_context_id)
                .map(|pc| pc.transfer_syntax.clone())
                .unwrap_or_default();
            let mut bytes = Vec::new();
            message
                .write_to(&mut bytes, &transfer_syntax)
                .context(MessageSnafu)?;
            Some(codec::read_dataset(&bytes[..], &transfer_syntax).unwrap())
        } else {
            None
        };
        let written = Written {
            presentation_context_id,
            command: message.command().clone(),
            dataset,
        };
        self.written.lock().unwrap().push(written.clone());

        let replies = (self.responder)(&Exchange {
            contexts: &self.contexts,
            written: &written,
        });
        for reply in replies {
            self.inbox.push_back(DimseMessage::outbound(
                reply.presentation_context_id,
                reply.command,
                reply.dataset,
                None,
            ));
        }
        Ok(())
    }

    fn write_release_request(&mut self) -> association::Result<()> {
        self.state = AssociationState::Releasing;
        Ok(())
    }

    fn release(&mut self, mode: ReleaseMode) -> association::Result<()> {
        if matches!(
            self.state,
            AssociationState::Established | AssociationState::Releasing
        ) {
            self.releases.lock().unwrap().push(mode);
        }
        self.state = match mode {
            ReleaseMode::Graceful => AssociationState::Closed,
            ReleaseMode::Abort => AssociationState::Aborted,
        };
        Ok(())
    }
}

pub fn u16_of(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u16> {
    obj.element(tag).ok()?.uint16().ok()
}

pub fn str_of(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    let value = obj.element(tag).ok()?.to_str().ok()?;
    Some(value.trim_end_matches(['\0', ' ']).to_string())
}

pub fn strs_of(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Vec<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_multi_str().ok().map(|s| s.to_vec()))
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn reply(presentation_context_id: u8, command: InMemDicomObject) -> Reply {
    Reply {
        presentation_context_id,
        command,
        dataset: None,
    }
}

pub fn reply_with(
    presentation_context_id: u8,
    command: InMemDicomObject,
    dataset: InMemDicomObject,
) -> Reply {
    Reply {
        presentation_context_id,
        command,
        dataset: Some(dataset),
    }
}

/// A data set of UI elements.
pub fn uids(elements: &[(dicom_core::Tag, &str)]) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(
        elements
            .iter()
            .map(|(tag, uid)| DataElement::new(*tag, VR::UI, dicom_value!(Str, *uid))),
    )
}
