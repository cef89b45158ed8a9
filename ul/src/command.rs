//! Command set factory.
//!
//! Command sets are built without the data set type field,
//! which is settled when the command is bound into a
//! [`DimseMessage`](crate::DimseMessage).
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use std::fmt;

/// Data set type value meaning that no data set follows the command.
pub const NO_DATA_SET: u16 = 0x0101;

/// Data set type value meaning that a data set follows the command.
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// The DIMSE command field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CGetRq => 0x0010,
            CommandField::CGetRsp => 0x8010,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::CCancelRq => 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let field = match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        };
        Some(field)
    }

    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CGetRq => "C-GET-RQ",
            CommandField::CGetRsp => "C-GET-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
        };
        f.write_str(name)
    }
}

/// Request priority.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Low => 0x0002,
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
        }
    }
}

fn command_field(field: CommandField) -> InMemElement {
    DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [field.code()]))
}

fn request(
    field: CommandField,
    message_id: u16,
    sop_class_uid: &str,
    priority: Priority,
) -> Vec<InMemElement> {
    vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        command_field(field),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority.code()])),
    ]
}

fn response(
    field: CommandField,
    message_id: u16,
    sop_class_uid: &str,
    status: u16,
) -> Vec<InMemElement> {
    vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        command_field(field),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ]
}

pub fn echo_rq(message_id: u16) -> InMemDicomObject {
    let mut elements = request(
        CommandField::CEchoRq,
        message_id,
        uids::VERIFICATION,
        Priority::Medium,
    );
    // C-ECHO has no priority
    elements.retain(|e| e.header().tag != tags::PRIORITY);
    InMemDicomObject::command_from_element_iter(elements)
}

pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(request(
        CommandField::CFindRq,
        message_id,
        sop_class_uid,
        priority,
    ))
}

pub fn get_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(request(
        CommandField::CGetRq,
        message_id,
        sop_class_uid,
        priority,
    ))
}

pub fn move_rq(
    message_id: u16,
    sop_class_uid: &str,
    priority: Priority,
    move_destination: &str,
) -> InMemDicomObject {
    let mut elements = request(CommandField::CMoveRq, message_id, sop_class_uid, priority);
    elements.push(DataElement::new(
        tags::MOVE_DESTINATION,
        VR::AE,
        dicom_value!(Str, move_destination),
    ));
    InMemDicomObject::command_from_element_iter(elements)
}

pub fn store_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    priority: Priority,
) -> InMemDicomObject {
    let mut elements = request(CommandField::CStoreRq, message_id, sop_class_uid, priority);
    elements.push(DataElement::new(
        tags::AFFECTED_SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance_uid),
    ));
    InMemDicomObject::command_from_element_iter(elements)
}

/// A C-CANCEL-RQ for the exchange started by the given message.
pub fn cancel_rq(message_id_being_cancelled: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        command_field(CommandField::CCancelRq),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_being_cancelled]),
        ),
    ])
}

pub fn echo_rsp(message_id: u16, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(response(
        CommandField::CEchoRsp,
        message_id,
        uids::VERIFICATION,
        status,
    ))
}

pub fn find_rsp(message_id: u16, sop_class_uid: &str, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(response(
        CommandField::CFindRsp,
        message_id,
        sop_class_uid,
        status,
    ))
}

pub fn move_rsp(message_id: u16, sop_class_uid: &str, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(response(
        CommandField::CMoveRsp,
        message_id,
        sop_class_uid,
        status,
    ))
}

pub fn get_rsp(message_id: u16, sop_class_uid: &str, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(response(
        CommandField::CGetRsp,
        message_id,
        sop_class_uid,
        status,
    ))
}

/// A C-STORE-RSP, with an error comment for failure statuses.
pub fn store_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
    error_comment: Option<&str>,
) -> InMemDicomObject {
    let mut elements = response(CommandField::CStoreRsp, message_id, sop_class_uid, status);
    elements.push(DataElement::new(
        tags::AFFECTED_SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance_uid),
    ));
    if let Some(comment) = error_comment {
        // LO is bounded to 64 characters
        let comment: String = comment.chars().take(64).collect();
        elements.push(DataElement::new(
            tags::ERROR_COMMENT,
            VR::LO,
            dicom_value!(Str, comment),
        ));
    }
    InMemDicomObject::command_from_element_iter(elements)
}
