//! Query and retrieve identifiers.
//!
//! Each query granularity has a fixed template of return keys,
//! filled in with the matching keys of one call.
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use std::fmt;

/// The Query/Retrieve Level (0008,0052).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryLevel {
    Study,
    Series,
    Image,
}

impl QueryLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryLevel::Study => "STUDY",
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn empty(tag: dicom_core::Tag, vr: VR) -> InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::Empty)
}

fn text(tag: dicom_core::Tag, vr: VR, value: &str) -> InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

/// A UI element listing the given UIDs, empty if there are none.
fn uid_list(tag: dicom_core::Tag, uids: &[String]) -> InMemElement {
    if uids.is_empty() {
        empty(tag, VR::UI)
    } else {
        DataElement::new(tag, VR::UI, PrimitiveValue::Strs(uids.iter().cloned().collect()))
    }
}

fn level(level: QueryLevel) -> InMemElement {
    text(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.as_str())
}

/// A study level query.
///
/// Matches the studies of a patient when `patient` is given,
/// or the listed studies otherwise.
/// Performing Physician's Name is only returned for patient queries.
pub fn study_query(patient: Option<(&str, &str)>, study_uids: &[String]) -> InMemDicomObject {
    let mut elements = vec![
        empty(tags::STUDY_DATE, VR::DA),
        empty(tags::STUDY_TIME, VR::TM),
        empty(tags::ACCESSION_NUMBER, VR::SH),
        level(QueryLevel::Study),
        empty(tags::MODALITIES_IN_STUDY, VR::CS),
        empty(tags::INSTITUTION_NAME, VR::LO),
        empty(tags::REFERRING_PHYSICIAN_NAME, VR::PN),
        empty(tags::STUDY_DESCRIPTION, VR::LO),
        empty(tags::PATIENT_BIRTH_DATE, VR::DA),
        empty(tags::PATIENT_SEX, VR::CS),
        empty(tags::PATIENT_AGE, VR::AS),
        uid_list(tags::STUDY_INSTANCE_UID, study_uids),
        empty(tags::STUDY_ID, VR::SH),
    ];
    match patient {
        Some((patient_id, patient_name)) => {
            elements.push(empty(tags::PERFORMING_PHYSICIAN_NAME, VR::PN));
            elements.push(text(tags::PATIENT_NAME, VR::PN, patient_name));
            elements.push(text(tags::PATIENT_ID, VR::LO, patient_id));
        }
        None => {
            elements.push(empty(tags::PATIENT_NAME, VR::PN));
            elements.push(empty(tags::PATIENT_ID, VR::LO));
        }
    }
    InMemDicomObject::from_element_iter(elements)
}

fn series_query(study_uids: &[String], series_uids: &[String]) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        level(QueryLevel::Series),
        empty(tags::MODALITY, VR::CS),
        uid_list(tags::STUDY_INSTANCE_UID, study_uids),
        uid_list(tags::SERIES_INSTANCE_UID, series_uids),
        empty(tags::SERIES_NUMBER, VR::IS),
        empty(tags::SERIES_DATE, VR::DA),
        empty(tags::SERIES_TIME, VR::TM),
        empty(tags::SERIES_DESCRIPTION, VR::LO),
    ])
}

/// A series level query for every series of the listed studies.
pub fn series_of_studies_query(study_uids: &[String]) -> InMemDicomObject {
    series_query(study_uids, &[])
}

/// A series level query for the listed series.
pub fn series_list_query(series_uids: &[String]) -> InMemDicomObject {
    series_query(&[], series_uids)
}

/// An image level query for the instances
/// of the listed studies and series.
pub fn instance_query(study_uids: &[String], series_uids: &[String]) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        empty(tags::SOP_INSTANCE_UID, VR::UI),
        level(QueryLevel::Image),
        uid_list(tags::SERIES_INSTANCE_UID, series_uids),
        uid_list(tags::STUDY_INSTANCE_UID, study_uids),
    ])
}

/// The identifier of a C-GET.
///
/// The level is that of the most specific identifier given.
/// Returns `None` if no identifier is given.
pub fn retrieve_identifier(
    study_uid: Option<&str>,
    series_uid: Option<&str>,
    sop_instance_uid: Option<&str>,
) -> Option<InMemDicomObject> {
    let query_level = match (study_uid, series_uid, sop_instance_uid) {
        (_, _, Some(_)) => QueryLevel::Image,
        (_, Some(_), None) => QueryLevel::Series,
        (Some(_), None, None) => QueryLevel::Study,
        (None, None, None) => return None,
    };
    let uid = |tag, value: Option<&str>| match value {
        Some(value) => text(tag, VR::UI, value),
        None => empty(tag, VR::UI),
    };
    Some(InMemDicomObject::from_element_iter([
        level(query_level),
        uid(tags::STUDY_INSTANCE_UID, study_uid),
        uid(tags::SERIES_INSTANCE_UID, series_uid),
        uid(tags::SOP_INSTANCE_UID, sop_instance_uid),
    ]))
}

/// The identifier of a series level C-MOVE within one study.
pub fn move_identifier(study_uid: &str, series_uids: &[String]) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        level(QueryLevel::Series),
        text(tags::STUDY_INSTANCE_UID, VR::UI, study_uid),
        uid_list(tags::SERIES_INSTANCE_UID, series_uids),
    ])
}
