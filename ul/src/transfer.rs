//! Transfer syntax properties needed on the wire.
use dicom_dictionary_std::uids;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dimse_core::ByteOrder;
use std::borrow::Cow;

/// Remove trailing padding from a UID.
pub fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with(['\0', ' ']) {
        Cow::Owned(uid.trim_end_matches(['\0', ' ']).to_string())
    } else {
        uid
    }
}

/// Look up a transfer syntax in the registry.
pub fn lookup(uid: &str) -> Option<&'static TransferSyntax> {
    TransferSyntaxRegistry.get(&trim_uid(Cow::Borrowed(uid)))
}

/// The byte order of values encoded in the given transfer syntax.
pub fn byte_order(uid: &str) -> ByteOrder {
    if trim_uid(Cow::Borrowed(uid)) == uids::EXPLICIT_VR_BIG_ENDIAN {
        ByteOrder::BigEndian
    } else {
        ByteOrder::LittleEndian
    }
}

/// Whether element headers omit the value representation.
pub fn is_implicit_vr(uid: &str) -> bool {
    trim_uid(Cow::Borrowed(uid)) == uids::IMPLICIT_VR_LITTLE_ENDIAN
}

/// Whether pixel data is encapsulated in fragments
/// under the given transfer syntax.
pub fn is_encapsulated(uid: &str) -> bool {
    !matches!(
        &*trim_uid(Cow::Borrowed(uid)),
        uids::IMPLICIT_VR_LITTLE_ENDIAN
            | uids::EXPLICIT_VR_LITTLE_ENDIAN
            | uids::EXPLICIT_VR_BIG_ENDIAN
            | uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
    )
}
