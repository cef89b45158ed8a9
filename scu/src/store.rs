//! Preparation of composite instances for C-STORE.
//!
//! A [`StoreSource`] writes a data set in three parts:
//! the elements before Pixel Data, the Pixel Data element itself,
//! and the elements after it.
//! Pixel Data is copied as is,
//! fragment by fragment when encapsulated,
//! and swapped word by word when the byte order changes for OW data.
use byteordered::{ByteOrdered, Endianness};
use dicom_core::header::Header;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{open_file, InMemDicomObject};
use dimse_core::{ByteOrder, ValueBuffer};
use dimse_ul::message::BoxError;
use dimse_ul::transfer::{self, trim_uid};
use dimse_ul::{codec, DataSource};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::debug;
use std::borrow::Cow;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Item (FFFE,E000)
const ITEM: Tag = Tag(0xFFFE, 0xE000);
/// Sequence Delimitation Item (FFFE,E0DD)
const SEQUENCE_DELIMITATION_ITEM: Tag = Tag(0xFFFE, 0xE0DD);
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const FILE_META_GROUP: u16 = 0x0002;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not open file {}", path.display()))]
    OpenFile { path: PathBuf, source: BoxError },

    #[snafu(display("unsupported pixel data value of VR {}", vr))]
    UnsupportedPixelData { vr: VR, backtrace: Backtrace },

    #[snafu(display(
        "cannot write {} pixel data in transfer syntax {}",
        if *encapsulated { "encapsulated" } else { "native" },
        transfer_syntax
    ))]
    PixelDataMismatch {
        encapsulated: bool,
        transfer_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("illegal length of OW pixel data"))]
    SwapPixelData { source: dimse_core::buffer::Error },

    #[snafu(display("could not write data set"))]
    WriteDataset { source: codec::Error },

    #[snafu(display("pixel data part of {} bytes is too long", length))]
    PixelDataTooLong { length: usize, backtrace: Backtrace },

    #[snafu(display("could not write pixel data"))]
    WritePixelData {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn text_value(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = dataset.element(tag).ok()?.to_str().ok()?;
    let value = trim_uid(Cow::Borrowed(value.trim())).into_owned();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// The transfer syntax to store a data set in.
///
/// Transfer Syntax UID (0002,0010) in the data set itself comes first,
/// then the given transfer syntax,
/// then implicit VR little endian.
pub fn resolve_transfer_syntax(dataset: &InMemDicomObject, fallback: Option<&str>) -> String {
    text_value(dataset, tags::TRANSFER_SYNTAX_UID)
        .or_else(|| {
            fallback
                .map(|ts| trim_uid(Cow::Borrowed(ts.trim())).into_owned())
                .filter(|ts| !ts.is_empty())
        })
        .unwrap_or_else(|| uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string())
}

/// The identity of an instance to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreParams {
    pub sop_class_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub transfer_syntax: String,
}

impl StoreParams {
    pub fn of(dataset: &InMemDicomObject, fallback_transfer_syntax: Option<&str>) -> Self {
        StoreParams {
            sop_class_uid: text_value(dataset, tags::SOP_CLASS_UID),
            sop_instance_uid: text_value(dataset, tags::SOP_INSTANCE_UID),
            transfer_syntax: resolve_transfer_syntax(dataset, fallback_transfer_syntax),
        }
    }
}

/// Read a DICOM file,
/// returning its data set and the transfer syntax in its file meta group.
pub fn read_file(path: &Path) -> Result<(InMemDicomObject, String)> {
    let obj = open_file(path)
        .map_err(|e| Box::new(e) as BoxError)
        .context(OpenFileSnafu { path })?;
    let transfer_syntax = trim_uid(Cow::Borrowed(obj.meta().transfer_syntax())).into_owned();
    Ok((obj.into_inner(), transfer_syntax))
}

#[derive(Debug, Clone)]
enum PixelData {
    Encapsulated {
        offset_table: Vec<u32>,
        fragments: Vec<Vec<u8>>,
    },
    Native {
        vr: VR,
        buffer: ValueBuffer,
    },
}

/// A data source writing a data set around its pixel data.
#[derive(Debug, Clone)]
pub struct StoreSource {
    head: InMemDicomObject,
    pixel_data: Option<PixelData>,
    tail: InMemDicomObject,
}

impl StoreSource {
    /// Split a data set encoded in the given transfer syntax.
    ///
    /// File meta information elements (group 0002) are left out.
    pub fn new(dataset: InMemDicomObject, transfer_syntax: &str) -> Result<Self> {
        let order = transfer::byte_order(transfer_syntax);
        let mut head = Vec::new();
        let mut tail = Vec::new();
        let mut pixel_data = None;
        for element in dataset {
            let tag = element.tag();
            if tag.group() == FILE_META_GROUP {
                debug!("Leaving out file meta element {}", tag);
                continue;
            }
            if tag < tags::PIXEL_DATA {
                head.push(element);
            } else if tag > tags::PIXEL_DATA {
                tail.push(element);
            } else {
                let vr = element.vr();
                let value = element.value();
                pixel_data = Some(match (value.fragments(), value.primitive()) {
                    (Some(fragments), _) => PixelData::Encapsulated {
                        offset_table: value.offset_table().map(|t| t.to_vec()).unwrap_or_default(),
                        fragments: fragments.to_vec(),
                    },
                    (None, Some(dicom_core::PrimitiveValue::U8(bytes))) => PixelData::Native {
                        vr,
                        buffer: ValueBuffer::new(bytes.to_vec(), order),
                    },
                    (None, Some(dicom_core::PrimitiveValue::U16(words))) => {
                        let bytes: Vec<u8> = words
                            .iter()
                            .flat_map(|w| match order {
                                ByteOrder::LittleEndian => w.to_le_bytes(),
                                ByteOrder::BigEndian => w.to_be_bytes(),
                            })
                            .collect();
                        PixelData::Native {
                            vr,
                            buffer: ValueBuffer::new(bytes, order),
                        }
                    }
                    _ => return UnsupportedPixelDataSnafu { vr }.fail(),
                });
            }
        }
        Ok(StoreSource {
            head: InMemDicomObject::from_element_iter(head),
            pixel_data,
            tail: InMemDicomObject::from_element_iter(tail),
        })
    }

    /// Write the whole data set in the given transfer syntax.
    pub fn write_parts(&self, sink: &mut dyn Write, transfer_syntax: &str) -> Result<()> {
        codec::write_dataset(&self.head, &mut *sink, transfer_syntax).context(WriteDatasetSnafu)?;
        if let Some(pixel_data) = &self.pixel_data {
            write_pixel_data(sink, pixel_data, transfer_syntax)?;
        }
        codec::write_dataset(&self.tail, &mut *sink, transfer_syntax).context(WriteDatasetSnafu)
    }
}

impl DataSource for StoreSource {
    fn write_to(
        &mut self,
        sink: &mut dyn Write,
        transfer_syntax: &str,
    ) -> std::result::Result<(), BoxError> {
        self.write_parts(sink, transfer_syntax).map_err(Into::into)
    }
}

fn write_pixel_data(sink: &mut dyn Write, pixel_data: &PixelData, transfer_syntax: &str) -> Result<()> {
    let order = transfer::byte_order(transfer_syntax);
    let explicit_vr = !transfer::is_implicit_vr(transfer_syntax);
    let encapsulated = transfer::is_encapsulated(transfer_syntax);
    match pixel_data {
        PixelData::Encapsulated {
            offset_table,
            fragments,
        } => {
            ensure!(
                encapsulated,
                PixelDataMismatchSnafu {
                    encapsulated: true,
                    transfer_syntax,
                }
            );
            write_header(sink, order, explicit_vr.then_some(VR::OB), tags::PIXEL_DATA, UNDEFINED_LENGTH)
                .context(WritePixelDataSnafu)?;
            // basic offset table, always little endian
            let table: Vec<u8> = offset_table.iter().flat_map(|o| o.to_le_bytes()).collect();
            write_header(sink, order, None, ITEM, length_of(&table)?).context(WritePixelDataSnafu)?;
            sink.write_all(&table).context(WritePixelDataSnafu)?;
            for fragment in fragments {
                write_header(sink, order, None, ITEM, length_of(fragment)?)
                    .context(WritePixelDataSnafu)?;
                sink.write_all(fragment).context(WritePixelDataSnafu)?;
            }
            write_header(sink, order, None, SEQUENCE_DELIMITATION_ITEM, 0)
                .context(WritePixelDataSnafu)?;
        }
        PixelData::Native { vr, buffer } => {
            ensure!(
                !encapsulated,
                PixelDataMismatchSnafu {
                    encapsulated: false,
                    transfer_syntax,
                }
            );
            let mut buffer = buffer.clone();
            if *vr == VR::OW && buffer.order() != order {
                buffer.swap_words().context(SwapPixelDataSnafu)?;
            }
            write_header(
                sink,
                order,
                explicit_vr.then_some(*vr),
                tags::PIXEL_DATA,
                length_of(buffer.as_bytes())?,
            )
            .context(WritePixelDataSnafu)?;
            sink.write_all(buffer.as_bytes())
                .context(WritePixelDataSnafu)?;
        }
    }
    Ok(())
}

/// The length of a value, which must fit a 32-bit length field
/// without being mistaken for an undefined length.
fn length_of(bytes: &[u8]) -> Result<u32> {
    u32::try_from(bytes.len())
        .ok()
        .filter(|&length| length != UNDEFINED_LENGTH)
        .context(PixelDataTooLongSnafu {
            length: bytes.len(),
        })
}

/// Whether the VR has a 4-byte length field in explicit VR syntaxes.
fn has_long_length(vr: VR) -> bool {
    matches!(
        vr,
        VR::OB | VR::OD | VR::OF | VR::OL | VR::OV | VR::OW | VR::SQ | VR::UC | VR::UN | VR::UR | VR::UT
    )
}

/// Write an element header.
///
/// The VR is only written when given.
fn write_header(
    sink: &mut dyn Write,
    order: ByteOrder,
    vr: Option<VR>,
    tag: Tag,
    length: u32,
) -> std::io::Result<()> {
    let endianness = match order {
        ByteOrder::LittleEndian => Endianness::Little,
        ByteOrder::BigEndian => Endianness::Big,
    };
    let mut out = ByteOrdered::runtime(sink, endianness);
    out.write_u16(tag.group())?;
    out.write_u16(tag.element())?;
    match vr {
        Some(vr) => {
            out.write_all(vr.to_string().as_bytes())?;
            if has_long_length(vr) {
                out.write_u16(0)?;
                out.write_u32(length)?;
            } else {
                out.write_u16(length as u16)?;
            }
        }
        None => out.write_u32(length)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::value::{PixelFragmentSequence, Value};
    use dicom_core::{dicom_value, DataElement, PrimitiveValue};

    fn base() -> Vec<dicom_object::mem::InMemElement> {
        vec![
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4\0")),
            DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [1])),
        ]
    }

    fn with_tail(mut elements: Vec<dicom_object::mem::InMemElement>) -> InMemDicomObject {
        // private tag after Pixel Data
        elements.push(DataElement::new(
            Tag(0x7FE1, 0x0010),
            VR::LO,
            dicom_value!(Str, "TAIL"),
        ));
        InMemDicomObject::from_element_iter(elements)
    }

    #[test]
    fn transfer_syntax_resolution_order() {
        let mut dataset = InMemDicomObject::from_element_iter(base());
        assert_eq!(
            resolve_transfer_syntax(&dataset, None),
            uids::IMPLICIT_VR_LITTLE_ENDIAN
        );
        assert_eq!(
            resolve_transfer_syntax(&dataset, Some(uids::EXPLICIT_VR_LITTLE_ENDIAN)),
            uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
        assert_eq!(
            resolve_transfer_syntax(&dataset, Some("")),
            uids::IMPLICIT_VR_LITTLE_ENDIAN
        );
        dataset.put(DataElement::new(
            tags::TRANSFER_SYNTAX_UID,
            VR::UI,
            dicom_value!(Str, uids::EXPLICIT_VR_BIG_ENDIAN),
        ));
        assert_eq!(
            resolve_transfer_syntax(&dataset, Some(uids::EXPLICIT_VR_LITTLE_ENDIAN)),
            uids::EXPLICIT_VR_BIG_ENDIAN
        );

        let params = StoreParams::of(&dataset, None);
        assert_eq!(params.sop_class_uid.as_deref(), Some(uids::CT_IMAGE_STORAGE));
        assert_eq!(params.sop_instance_uid.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn native_pixel_data_is_copied() {
        let mut elements = base();
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U16([0x0102, 0x0304].into_iter().collect()),
        ));
        let dataset = with_tail(elements);
        let source = StoreSource::new(dataset.clone(), uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();

        let mut bytes = Vec::new();
        source
            .write_parts(&mut bytes, uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .unwrap();
        let back = codec::read_dataset(&bytes[..], uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(
            back.element(tags::PIXEL_DATA).unwrap().to_multi_int::<u16>().unwrap(),
            vec![0x0102, 0x0304]
        );
        assert_eq!(
            back.element(Tag(0x7FE1, 0x0010)).unwrap().to_str().unwrap(),
            "TAIL"
        );
        assert_eq!(back.element(tags::ROWS).unwrap().to_int::<u16>().unwrap(), 1);
    }

    #[test]
    fn file_meta_elements_stay_out_of_the_data_set() {
        let mut elements = base();
        elements.push(DataElement::new(
            tags::TRANSFER_SYNTAX_UID,
            VR::UI,
            dicom_value!(Str, uids::EXPLICIT_VR_LITTLE_ENDIAN),
        ));
        elements.push(DataElement::new(
            tags::MEDIA_STORAGE_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4"),
        ));
        let source = StoreSource::new(
            InMemDicomObject::from_element_iter(elements),
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
        )
        .unwrap();

        let mut bytes = Vec::new();
        source
            .write_parts(&mut bytes, uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .unwrap();
        // the first element written is SOP Class UID (0008,0016)
        assert_eq!(&bytes[..4], &[0x08, 0x00, 0x16, 0x00]);
        let back = codec::read_dataset(&bytes[..], uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert!(back.element(tags::TRANSFER_SYNTAX_UID).is_err());
        assert!(back.element(tags::MEDIA_STORAGE_SOP_INSTANCE_UID).is_err());
        assert_eq!(back.element(tags::ROWS).unwrap().to_int::<u16>().unwrap(), 1);
    }

    #[test]
    fn ow_pixel_data_is_swapped_across_byte_orders() {
        let mut elements = base();
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U16([0x0102, 0x0304].into_iter().collect()),
        ));
        let source = StoreSource::new(
            InMemDicomObject::from_element_iter(elements),
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
        )
        .unwrap();

        let mut bytes = Vec::new();
        source
            .write_parts(&mut bytes, uids::EXPLICIT_VR_BIG_ENDIAN)
            .unwrap();
        // the pixel data element closes the stream
        let tail = &bytes[bytes.len() - 16..];
        assert_eq!(
            tail,
            &[0x7F, 0xE0, 0x00, 0x10, b'O', b'W', 0, 0, 0, 0, 0, 4, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn encapsulated_pixel_data_keeps_fragments() {
        let mut elements = base();
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            Value::PixelSequence(PixelFragmentSequence::new(
                vec![0u32],
                vec![vec![0xFF, 0xD8, 0xFF, 0xD9]],
            )),
        ));
        let source = StoreSource::new(
            InMemDicomObject::from_element_iter(elements),
            uids::JPEG_BASELINE8_BIT,
        )
        .unwrap();

        let mut bytes = Vec::new();
        source.write_parts(&mut bytes, uids::JPEG_BASELINE8_BIT).unwrap();
        let expected_pixel_data: &[u8] = &[
            0xE0, 0x7F, 0x10, 0x00, b'O', b'B', 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, // header
            0xFE, 0xFF, 0x00, 0xE0, 4, 0, 0, 0, 0, 0, 0, 0, // offset table
            0xFE, 0xFF, 0x00, 0xE0, 4, 0, 0, 0, 0xFF, 0xD8, 0xFF, 0xD9, // fragment
            0xFE, 0xFF, 0xDD, 0xE0, 0, 0, 0, 0, // delimiter
        ];
        assert!(bytes.ends_with(expected_pixel_data));

        // fragments cannot be written natively
        let err = source
            .write_parts(&mut Vec::new(), uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .unwrap_err();
        assert!(matches!(err, Error::PixelDataMismatch { encapsulated: true, .. }));
    }

    #[test]
    fn odd_ow_pixel_data_cannot_be_swapped() {
        let mut elements = base();
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U8([1, 2, 3].into_iter().collect()),
        ));
        let source = StoreSource::new(
            InMemDicomObject::from_element_iter(elements),
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
        )
        .unwrap();
        let err = source
            .write_parts(&mut Vec::new(), uids::EXPLICIT_VR_BIG_ENDIAN)
            .unwrap_err();
        assert!(matches!(err, Error::SwapPixelData { .. }));
    }

    #[test]
    fn files_are_read_with_their_transfer_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.dcm");
        let meta = dicom_object::FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
            .media_storage_sop_instance_uid("1.2.3.4")
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .build()
            .unwrap();
        InMemDicomObject::from_element_iter(base())
            .with_exact_meta(meta)
            .write_to_file(&path)
            .unwrap();

        let (dataset, transfer_syntax) = read_file(&path).unwrap();
        assert_eq!(transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(
            StoreParams::of(&dataset, Some(&transfer_syntax)).transfer_syntax,
            uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
        assert!(matches!(
            read_file(&dir.path().join("missing.dcm")),
            Err(Error::OpenFile { .. })
        ));
    }
}
