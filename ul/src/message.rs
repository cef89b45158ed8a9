//! DIMSE messages.
//!
//! A [`DimseMessage`] binds a command set to its data set, if any.
//! Inbound messages hold the raw data set stream
//! until the data set is first requested,
//! at which point it is decoded and the stream is released.
//! Outbound messages hold either an in-memory data set
//! or a [`DataSource`] that writes the data set on demand.
use crate::codec;
use crate::command::{CommandField, DATA_SET_PRESENT, NO_DATA_SET};
use crate::transfer::trim_uid;
use dicom_core::header::Header;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};

/// A boxed error from a data source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "message on presentation context {} has a data set stream but no transfer syntax",
        presentation_context_id
    ))]
    MissingTransferSyntax {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "message on presentation context {} has no data set to write",
        presentation_context_id
    ))]
    MissingDataset {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },
    #[snafu(display("could not decode data set"))]
    Decode { source: codec::Error },
    #[snafu(display("could not encode data set"))]
    Encode { source: codec::Error },
    #[snafu(display("data source failed"))]
    DataSource { source: BoxError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A writer of an outbound data set.
///
/// Implementations may stream large data sets
/// without holding them in memory as a whole.
pub trait DataSource: Send {
    /// Write the data set in the given transfer syntax.
    fn write_to(
        &mut self,
        sink: &mut dyn Write,
        transfer_syntax: &str,
    ) -> std::result::Result<(), BoxError>;
}

/// One DIMSE command, with its optional data set.
pub struct DimseMessage {
    presentation_context_id: u8,
    command: InMemDicomObject,
    transfer_syntax: Option<String>,
    dataset: Option<InMemDicomObject>,
    source: Option<Box<dyn DataSource>>,
    stream: Option<Box<dyn Read + Send>>,
}

impl fmt::Debug for DimseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimseMessage")
            .field("presentation_context_id", &self.presentation_context_id)
            .field("command", &self.command)
            .field("transfer_syntax", &self.transfer_syntax)
            .field("dataset", &self.dataset)
            .field("source", &self.source.as_ref().map(|_| "..."))
            .field("stream", &self.stream.as_ref().map(|_| "..."))
            .finish()
    }
}

impl DimseMessage {
    /// A message received from the peer.
    ///
    /// The data set, if any, stays in `stream`
    /// until it is requested through [`dataset`](Self::dataset).
    pub fn inbound(
        presentation_context_id: u8,
        transfer_syntax: Option<String>,
        command: InMemDicomObject,
        stream: Option<Box<dyn Read + Send>>,
    ) -> Self {
        DimseMessage {
            presentation_context_id,
            command,
            transfer_syntax,
            dataset: None,
            source: None,
            stream,
        }
    }

    /// A message to send to the peer.
    ///
    /// The command's data set type is set here,
    /// according to whether a data set or a data source is given.
    pub fn outbound(
        presentation_context_id: u8,
        command: InMemDicomObject,
        dataset: Option<InMemDicomObject>,
        source: Option<Box<dyn DataSource>>,
    ) -> Self {
        let data_set_type = if dataset.is_none() && source.is_none() {
            NO_DATA_SET
        } else {
            DATA_SET_PRESENT
        };
        let command = InMemDicomObject::command_from_element_iter(
            command
                .into_iter()
                .filter(|e| {
                    e.tag() != tags::COMMAND_GROUP_LENGTH && e.tag() != tags::COMMAND_DATA_SET_TYPE
                })
                .chain(std::iter::once(DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [data_set_type]),
                ))),
        );
        DimseMessage {
            presentation_context_id,
            command,
            transfer_syntax: None,
            dataset,
            source,
            stream: None,
        }
    }

    /// A message without a data set.
    pub fn command_only(presentation_context_id: u8, command: InMemDicomObject) -> Self {
        Self::outbound(presentation_context_id, command, None, None)
    }

    pub fn presentation_context_id(&self) -> u8 {
        self.presentation_context_id
    }

    pub fn command(&self) -> &InMemDicomObject {
        &self.command
    }

    pub fn transfer_syntax(&self) -> Option<&str> {
        self.transfer_syntax.as_deref()
    }

    /// Retrieve the data set,
    /// decoding it from the inbound stream on first access.
    ///
    /// The stream is consumed by the first call,
    /// later calls return the same decoded data set.
    pub fn dataset(&mut self) -> Result<Option<&InMemDicomObject>> {
        if self.dataset.is_none() && self.stream.is_some() {
            let transfer_syntax =
                self.transfer_syntax
                    .as_deref()
                    .context(MissingTransferSyntaxSnafu {
                        presentation_context_id: self.presentation_context_id,
                    })?;
            if let Some(stream) = self.stream.take() {
                let obj = codec::read_dataset(stream, transfer_syntax).context(DecodeSnafu)?;
                self.dataset = Some(obj);
            }
        }
        Ok(self.dataset.as_ref())
    }

    /// Take the data set out of the message,
    /// decoding it first if necessary.
    pub fn take_dataset(&mut self) -> Result<Option<InMemDicomObject>> {
        self.dataset()?;
        Ok(self.dataset.take())
    }

    /// Write the data set to `sink` in the given transfer syntax.
    ///
    /// A data source takes precedence over an in-memory data set.
    pub fn write_to(&mut self, sink: &mut dyn Write, transfer_syntax: &str) -> Result<()> {
        if let Some(source) = self.source.as_mut() {
            return source
                .write_to(sink, transfer_syntax)
                .context(DataSourceSnafu);
        }
        let dataset = self.dataset.as_ref().context(MissingDatasetSnafu {
            presentation_context_id: self.presentation_context_id,
        })?;
        codec::write_dataset(dataset, sink, transfer_syntax).context(EncodeSnafu)
    }

    fn command_u16(&self, tag: dicom_core::Tag) -> Option<u16> {
        self.command.element(tag).ok()?.uint16().ok()
    }

    fn command_uid(&self, tag: dicom_core::Tag) -> Option<String> {
        let value = self.command.element(tag).ok()?.to_str().ok()?;
        Some(trim_uid(Cow::Borrowed(&*value)).into_owned())
    }

    pub fn command_field(&self) -> Option<CommandField> {
        self.command_u16(tags::COMMAND_FIELD)
            .and_then(CommandField::from_code)
    }

    pub fn message_id(&self) -> Option<u16> {
        self.command_u16(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        self.command_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn status(&self) -> Option<u16> {
        self.command_u16(tags::STATUS)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.command_uid(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.command_uid(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    /// Whether the command announces a data set.
    pub fn has_dataset(&self) -> bool {
        self.command_u16(tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false)
    }
}

impl fmt::Display for DimseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[pc-{}] ", self.presentation_context_id)?;
        match self.command_field() {
            Some(field) => write!(f, "{}", field)?,
            None => f.write_str("<unknown command>")?,
        }
        if let Some(id) = self.message_id() {
            write!(f, " #{}", id)?;
        }
        if let Some(id) = self.message_id_being_responded_to() {
            write!(f, " responding to #{}", id)?;
        }
        if let Some(status) = self.status() {
            write!(f, " status {:04X}H", status)?;
        }
        Ok(())
    }
}
