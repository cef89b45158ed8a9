//! A DICOM store receiver.
//!
//! [`StoreScp`] validates each inbound C-STORE request
//! and writes the instance into an archive directory,
//! nested by patient name prefix, study, series and instance number.
//! Failures are reported back to the peer
//! as a status code in the C-STORE response.
//!
//! [`StoreScp::serve`] drives a whole association,
//! answering C-ECHO requests along the way.
use dicom_core::header::Header;
use dicom_core::{PrimitiveValue, Tag};
use dicom_dictionary_std::tags;
use dicom_encoding::text::DefaultCharacterSetCodec;
use dicom_object::mem::InMemElement;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dimse_core::{ByteOrder, DataElement as Cell, Item, Primitive, Value, ValueBuffer};
use dimse_ul::association::{self, Association};
use dimse_ul::command::{self, CommandField};
use dimse_ul::{message, status, DimseMessage};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod syntax;

/// How long to wait for the next request before checking again.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The maximum length of a UI value.
const MAX_UID_LENGTH: usize = 64;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not create archive directory {}", path.display()))]
    CreateArchive {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("missing {}", what))]
    MissingUid {
        what: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("{} is not a UID", what))]
    InvalidUid {
        what: &'static str,
        source: dimse_core::element::Error,
    },

    #[snafu(display("{} does not match the file meta information", what))]
    MismatchUid {
        what: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("request has no data set"))]
    MissingDataset { backtrace: Backtrace },

    #[snafu(display("could not decode data set"))]
    Decode { source: message::Error },

    #[snafu(display("could not build file meta information"))]
    BuildMeta { source: dicom_object::meta::Error },

    #[snafu(display("could not create directory {}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not write {}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: dicom_object::WriteError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The C-STORE response status reporting this error.
    pub fn status(&self) -> u16 {
        match self {
            Error::MissingUid { .. } => status::MISSING_UID,
            Error::MismatchUid { .. } => status::MISMATCH_UID,
            Error::InvalidUid { .. } | Error::MissingDataset { .. } | Error::Decode { .. } => {
                status::CANNOT_UNDERSTAND
            }
            _ => status::PROCESSING_FAILURE,
        }
    }
}

/// Receives composite instances into an archive directory.
#[derive(Debug, Clone)]
pub struct StoreScp {
    archive_dir: PathBuf,
    dir_split_level: usize,
}

impl StoreScp {
    /// Create a receiver writing into `archive_dir`,
    /// creating the directory if needed.
    pub fn new(archive_dir: impl Into<PathBuf>) -> Result<Self> {
        let archive_dir = archive_dir.into();
        std::fs::create_dir_all(&archive_dir).context(CreateArchiveSnafu {
            path: &archive_dir,
        })?;
        Ok(StoreScp {
            archive_dir,
            dir_split_level: 1,
        })
    }

    /// Override the number of patient name prefix directories.
    ///
    /// Level `n` nests instances under prefixes of 1 to `n` characters.
    pub fn dir_split_level(mut self, level: usize) -> Self {
        self.dir_split_level = level;
        self
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Handle an inbound C-STORE request,
    /// producing the response to send back on the same presentation context.
    pub fn handle_store(&self, request: &mut DimseMessage) -> DimseMessage {
        let message_id = request.message_id().unwrap_or_default();
        let sop_class_uid = request.affected_sop_class_uid().unwrap_or_default();
        let sop_instance_uid = request.affected_sop_instance_uid().unwrap_or_default();

        let (status, comment) = match self.store(request) {
            Ok(_) => (status::SUCCESS, None),
            Err(e) => {
                error!(
                    "Could not store {}: {}",
                    sop_instance_uid,
                    snafu::Report::from_error(&e)
                );
                (e.status(), Some(e.to_string()))
            }
        };
        DimseMessage::command_only(
            request.presentation_context_id(),
            command::store_rsp(
                message_id,
                &sop_class_uid,
                &sop_instance_uid,
                status,
                comment.as_deref(),
            ),
        )
    }

    /// Validate the instance in a C-STORE request and write it to the archive,
    /// returning the path of the new file.
    ///
    /// Nothing is written unless validation succeeds.
    pub fn store(&self, request: &mut DimseMessage) -> Result<PathBuf> {
        let sop_class_uid = request.affected_sop_class_uid().unwrap_or_default();
        let sop_instance_uid = request.affected_sop_instance_uid().unwrap_or_default();
        let transfer_syntax = request
            .transfer_syntax()
            .unwrap_or(dicom_dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN)
            .to_string();

        let dataset = request
            .take_dataset()
            .context(DecodeSnafu)?
            .context(MissingDatasetSnafu)?;

        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uid)
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax(transfer_syntax)
            .build()
            .context(BuildMetaSnafu)?;

        validate(
            &dataset,
            meta.media_storage_sop_instance_uid(),
            meta.media_storage_sop_class_uid(),
        )?;

        let path = self.file_path(&dataset);
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                info!("M-WRITE {}", dir.display());
                std::fs::create_dir_all(dir).context(CreateDirectorySnafu { path: dir })?;
            }
        }
        info!("M-WRITE {}", path.display());
        dataset
            .with_exact_meta(meta)
            .write_to_file(&path)
            .context(WriteFileSnafu { path: &path })?;
        Ok(path)
    }

    /// The archive path of an instance:
    /// `<prefix>/.../<study uid>/<series number>/<instance number>.dcm`
    /// under the archive directory.
    pub fn file_path(&self, dataset: &InMemDicomObject) -> PathBuf {
        let patient = to_file_id(dataset, tags::PATIENT_NAME) + "____";
        let mut path = self.archive_dir.clone();
        for i in 0..self.dir_split_level {
            path.push(patient.chars().take(i + 1).collect::<String>());
        }
        path.push(study_fragment(dataset));
        path.push(to_file_id(dataset, tags::SERIES_NUMBER));
        path.push(to_file_id(dataset, tags::INSTANCE_NUMBER) + ".dcm");
        path
    }

    /// Serve an association until it is released or aborted,
    /// answering C-ECHO and C-STORE requests.
    pub fn serve(&self, association: &mut dyn Association) -> association::Result<()> {
        loop {
            let mut request = match association.read(IDLE_TIMEOUT) {
                Ok(request) => request,
                Err(association::Error::Timeout { .. }) => continue,
                Err(association::Error::Closed { .. }) => {
                    info!("Association released");
                    return Ok(());
                }
                Err(association::Error::Aborted { .. }) => {
                    warn!("Association aborted by the peer");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            debug!("Received {}", request);

            let mut response = match request.command_field() {
                Some(CommandField::CEchoRq) => DimseMessage::command_only(
                    request.presentation_context_id(),
                    command::echo_rsp(request.message_id().unwrap_or_default(), status::SUCCESS),
                ),
                Some(CommandField::CStoreRq) => self.handle_store(&mut request),
                _ => {
                    warn!("Ignoring unsupported request {}", request);
                    continue;
                }
            };
            association.write(&mut response)?;
        }
    }
}

/// Check the identifiers of an instance against its file meta information,
/// in the order the failures are reported.
fn validate(
    dataset: &InMemDicomObject,
    meta_instance_uid: &str,
    meta_class_uid: &str,
) -> Result<()> {
    first_uid(dataset, tags::STUDY_INSTANCE_UID, "Study Instance UID")?;
    uid_values(dataset, tags::SERIES_INSTANCE_UID, "Series Instance UID")?
        .into_iter()
        .next()
        .context(MissingUidSnafu {
            what: "Series Instance UID",
        })?;
    let instance = first_uid(dataset, tags::SOP_INSTANCE_UID, "SOP Instance UID")?;
    let class = first_uid(dataset, tags::SOP_CLASS_UID, "SOP Class UID")?;
    snafu::ensure!(
        instance == trim(meta_instance_uid),
        MismatchUidSnafu {
            what: "SOP Instance UID"
        }
    );
    snafu::ensure!(
        class == trim(meta_class_uid),
        MismatchUidSnafu {
            what: "SOP Class UID"
        }
    );
    Ok(())
}

fn first_uid(dataset: &InMemDicomObject, tag: Tag, what: &'static str) -> Result<String> {
    uid_values(dataset, tag, what)?
        .into_iter()
        .next()
        .context(MissingUidSnafu { what })
}

/// The non-blank values of a UID element, none if it is missing.
///
/// Values which are not text are refused,
/// with a description of the element.
fn uid_values(dataset: &InMemDicomObject, tag: Tag, what: &'static str) -> Result<Vec<String>> {
    let Ok(element) = dataset.element(tag) else {
        return Ok(Vec::new());
    };
    let cell = cell(element).context(InvalidUidSnafu { what })?;
    if cell.is_empty() {
        return Ok(Vec::new());
    }
    let values = cell
        .strings(&DefaultCharacterSetCodec)
        .context(InvalidUidSnafu { what })?;
    Ok(values
        .iter()
        .map(|value| trim(value).to_string())
        .filter(|value| !value.is_empty())
        .collect())
}

/// The element as a value cell.
///
/// Text stays text, other primitives become little endian bytes.
/// Only the shape of sequences and fragments is kept.
fn cell(element: &InMemElement) -> dimse_core::element::Result<Cell> {
    let value = element.value();
    let value = if let Some(items) = value.items() {
        Value::Sequence(vec![Item::new(); items.len()])
    } else if let Some(fragments) = value.fragments() {
        Value::Fragments(
            fragments
                .iter()
                .map(|fragment| ValueBuffer::new(fragment.clone(), ByteOrder::LittleEndian))
                .collect(),
        )
    } else {
        match value.primitive() {
            None | Some(PrimitiveValue::Empty) => Value::Empty,
            Some(text @ (PrimitiveValue::Str(_) | PrimitiveValue::Strs(_))) => {
                let mut values: Vec<_> = text
                    .to_multi_str()
                    .iter()
                    .map(|s| Primitive::Text(s.as_bytes().to_vec()))
                    .collect();
                if values.len() == 1 {
                    Value::Single(values.remove(0))
                } else {
                    Value::Multi(values)
                }
            }
            Some(other) => Value::Single(Primitive::Binary(ValueBuffer::new(
                other.to_bytes().into_owned(),
                ByteOrder::LittleEndian,
            ))),
        }
    };
    Cell::new(element.tag(), element.vr(), value)
}

fn trim(value: &str) -> &str {
    value.trim_matches(['\0', ' '])
}

fn text(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = dataset.element(tag).ok()?.to_str().ok()?;
    let value = trim(&value);
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// A path fragment from an element value:
/// its first 8 characters in upper case,
/// with anything other than digits and letters replaced by `_`.
///
/// An empty or missing value maps to `__NULL__`,
/// a value which is not textual to `__ERR__`.
pub fn to_file_id(dataset: &InMemDicomObject, tag: Tag) -> String {
    let Ok(element) = dataset.element(tag) else {
        return "__NULL__".to_string();
    };
    let Ok(value) = element.to_str() else {
        return "__ERR__".to_string();
    };
    let value = trim(&value);
    if value.is_empty() {
        return "__NULL__".to_string();
    }
    value
        .to_uppercase()
        .chars()
        .take(8)
        .map(|c| {
            if c.is_ascii_digit() || c.is_ascii_uppercase() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The study instance UID as a single path component,
/// at most as long as a valid UID.
fn study_fragment(dataset: &InMemDicomObject) -> String {
    let uid = text(dataset, tags::STUDY_INSTANCE_UID).unwrap_or_default();
    if uid.chars().all(|c| c == '.') {
        return "__NULL__".to_string();
    }
    uid.chars()
        .take(MAX_UID_LENGTH)
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::uids;
    use dimse_ul::codec;
    use dimse_ul::command::Priority;
    use rstest::rstest;
    use std::io::Cursor;

    const INSTANCE_UID: &str = "1.2.3.4.5.6";

    fn dataset(elements: &[(Tag, VR, &str)]) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(
            elements
                .iter()
                .map(|(tag, vr, value)| DataElement::new(*tag, *vr, dicom_value!(Str, *value))),
        )
    }

    fn complete() -> Vec<(Tag, VR, &'static str)> {
        vec![
            (tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE),
            (tags::SOP_INSTANCE_UID, VR::UI, INSTANCE_UID),
            (tags::PATIENT_NAME, VR::PN, "Doe^John"),
            (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
            (tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4"),
            (tags::SERIES_NUMBER, VR::IS, "2"),
            (tags::INSTANCE_NUMBER, VR::IS, "17"),
        ]
    }

    fn request(obj: &InMemDicomObject, instance_uid: &str) -> DimseMessage {
        let ts = uids::EXPLICIT_VR_LITTLE_ENDIAN;
        let mut bytes = Vec::new();
        codec::write_dataset(obj, &mut bytes, ts).unwrap();
        DimseMessage::inbound(
            3,
            Some(ts.to_string()),
            command::store_rq(9, uids::CT_IMAGE_STORAGE, instance_uid, Priority::Medium),
            Some(Box::new(Cursor::new(bytes))),
        )
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[test]
    fn stores_into_nested_archive_path() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path().join("archive")).unwrap();
        let mut rq = request(&dataset(&complete()), INSTANCE_UID);

        let response = scp.handle_store(&mut rq);
        assert_eq!(response.presentation_context_id(), 3);
        assert_eq!(response.command_field(), Some(CommandField::CStoreRsp));
        assert_eq!(response.message_id_being_responded_to(), Some(9));
        assert_eq!(response.status(), Some(status::SUCCESS));
        assert_eq!(
            response.affected_sop_instance_uid().as_deref(),
            Some(INSTANCE_UID)
        );

        let expected = scp
            .archive_dir()
            .join("D")
            .join("1.2.3")
            .join("2")
            .join("17.dcm");
        assert!(expected.is_file());
        let stored = dicom_object::open_file(&expected).unwrap();
        assert_eq!(stored.meta().media_storage_sop_instance_uid(), INSTANCE_UID);
        assert_eq!(
            stored.meta().transfer_syntax(),
            uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
    }

    #[test]
    fn missing_study_uid_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path()).unwrap();
        let elements: Vec<_> = complete()
            .into_iter()
            .filter(|(tag, ..)| *tag != tags::STUDY_INSTANCE_UID)
            .collect();
        let mut rq = request(&dataset(&elements), INSTANCE_UID);

        let response = scp.handle_store(&mut rq);
        assert_eq!(response.status(), Some(status::MISSING_UID));
        assert!(response.command().element(tags::ERROR_COMMENT).is_ok());
        assert!(is_empty_dir(dir.path()));
    }

    #[test]
    fn mismatched_instance_uid_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path()).unwrap();
        let mut rq = request(&dataset(&complete()), "9.9.9");

        let err = scp.store(&mut rq).unwrap_err();
        assert!(matches!(err, Error::MismatchUid { what: "SOP Instance UID", .. }));
        assert_eq!(err.status(), status::MISMATCH_UID);
        assert!(is_empty_dir(dir.path()));
    }

    #[test]
    fn binary_instance_uid_cannot_be_understood() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path()).unwrap();
        let mut obj = dataset(&complete());
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::OB,
            PrimitiveValue::U8([0x31, 0x2E, 0x32, 0x00].into_iter().collect()),
        ));
        let mut rq = request(&obj, INSTANCE_UID);

        let err = scp.store(&mut rq).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidUid {
                what: "SOP Instance UID",
                source: dimse_core::element::Error::Unsupported { .. },
            }
        ));
        assert_eq!(err.status(), status::CANNOT_UNDERSTAND);
        let cause = std::error::Error::source(&err).unwrap().to_string();
        assert!(cause.contains("(0008,0018),OB,*1,#4"), "{}", cause);
        assert!(is_empty_dir(dir.path()));
    }

    #[test]
    fn request_without_data_set_cannot_be_understood() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path()).unwrap();
        let mut rq = DimseMessage::inbound(
            1,
            None,
            command::store_rq(2, uids::CT_IMAGE_STORAGE, INSTANCE_UID, Priority::Medium),
            None,
        );

        let response = scp.handle_store(&mut rq);
        assert_eq!(response.status(), Some(status::CANNOT_UNDERSTAND));
    }

    #[test]
    fn split_level_nests_name_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path()).unwrap().dir_split_level(3);
        let path = scp.file_path(&dataset(&complete()));
        assert_eq!(
            path,
            dir.path()
                .join("D")
                .join("DO")
                .join("DOE")
                .join("1.2.3")
                .join("2")
                .join("17.dcm")
        );
    }

    #[test]
    fn study_uid_cannot_escape_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path()).unwrap();
        let mut elements = complete();
        elements[3] = (tags::STUDY_INSTANCE_UID, VR::UI, "../..");
        let path = scp.file_path(&dataset(&elements));
        assert!(path.starts_with(scp.archive_dir()));
        assert!(path.components().all(|c| c.as_os_str() != ".."));
    }

    #[test]
    fn overlong_study_uid_is_cut_to_uid_length() {
        let dir = tempfile::tempdir().unwrap();
        let scp = StoreScp::new(dir.path()).unwrap();
        let long_uid = format!("1.2.{}", "3".repeat(300));
        let mut elements: Vec<(Tag, VR, &str)> = complete();
        elements[3] = (tags::STUDY_INSTANCE_UID, VR::UI, &long_uid);
        let obj = dataset(&elements);

        let fragment = study_fragment(&obj);
        assert_eq!(fragment.len(), 64);
        assert!(long_uid.starts_with(&fragment));

        let response = scp.handle_store(&mut request(&obj, INSTANCE_UID));
        assert_eq!(response.status(), Some(status::SUCCESS));
        assert!(scp.file_path(&obj).is_file());
    }

    #[rstest]
    #[case("Doe^John", "DOE_JOHN")]
    #[case("smith-jones^anne", "SMITH_JO")]
    #[case("", "__NULL__")]
    #[case("  ", "__NULL__")]
    fn file_ids(#[case] name: &str, #[case] expected: &str) {
        let obj = dataset(&[(tags::PATIENT_NAME, VR::PN, name)]);
        assert_eq!(to_file_id(&obj, tags::PATIENT_NAME), expected);
    }

    #[test]
    fn missing_value_file_id() {
        let obj = InMemDicomObject::new_empty();
        assert_eq!(to_file_id(&obj, tags::SERIES_NUMBER), "__NULL__");
    }
}
