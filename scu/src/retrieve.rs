//! Grouping of series into C-MOVE batches.
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse_ul::transfer::trim_uid;
use std::borrow::Cow;
use tracing::warn;

/// The series of one study to move together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyBatch {
    pub study_uid: String,
    pub series_uids: Vec<String>,
}

pub(crate) fn uid_of(dataset: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    let value = dataset.element(tag).ok()?.to_str().ok()?;
    let uid = trim_uid(Cow::Borrowed(&*value)).into_owned();
    if uid.is_empty() {
        None
    } else {
        Some(uid)
    }
}

/// Group series level datasets by their Study Instance UID.
///
/// Batches come in order of first appearance of their study,
/// and series UIDs in order of first appearance within each batch,
/// without duplicates.
/// Datasets lacking either UID are skipped.
pub fn group_by_study<'a, I>(series: I) -> Vec<StudyBatch>
where
    I: IntoIterator<Item = &'a InMemDicomObject>,
{
    let mut batches: Vec<StudyBatch> = Vec::new();
    for dataset in series {
        let (Some(study_uid), Some(series_uid)) = (
            uid_of(dataset, tags::STUDY_INSTANCE_UID),
            uid_of(dataset, tags::SERIES_INSTANCE_UID),
        ) else {
            warn!("Skipping series without study or series instance UID");
            continue;
        };
        let index = match batches.iter().position(|b| b.study_uid == study_uid) {
            Some(index) => index,
            None => {
                batches.push(StudyBatch {
                    study_uid,
                    series_uids: Vec::new(),
                });
                batches.len() - 1
            }
        };
        let batch = &mut batches[index];
        if !batch.series_uids.contains(&series_uid) {
            batch.series_uids.push(series_uid);
        }
    }
    batches
}
