//! The data element cell.
//!
//! A [`DataElement`] holds one tagged value,
//! which is either empty, a single primitive (scalar),
//! a list of primitives (multi-valued),
//! a sequence of nested [`Item`]s,
//! or a list of raw byte fragments (encapsulated pixel data).
//!
//! Accessors only succeed on the variants that support them.
//! Anything else fails with [`Error::Unsupported`],
//! the message of which describes the element in full.
use crate::buffer::{self, ByteOrder, ValueBuffer};
use crate::order::Tagged;
use chrono::NaiveDate;
use dicom_core::{Length, Tag, VR};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::fmt;

/// The maximum number of characters shown in an element value preview.
pub const PREVIEW_LENGTH: usize = 64;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("`{}` is not supported by element {}", operation, element))]
    Unsupported {
        operation: &'static str,
        element: String,
        backtrace: Backtrace,
    },
    #[snafu(display("no value at index {} in element {}", index, element))]
    IndexOutOfBounds {
        index: usize,
        element: String,
        backtrace: Backtrace,
    },
    #[snafu(display("could not decode text of element {}: {}", element, message))]
    DecodeText {
        element: String,
        message: String,
        backtrace: Backtrace,
    },
    #[snafu(display("value of {} bytes does not fit the length of element {}", size, tag))]
    ValueTooLong {
        tag: Tag,
        size: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("could not swap value of element {}", element))]
    SwapValue {
        element: String,
        source: buffer::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single primitive value.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Int(i32),
    Float(f32),
    Double(f64),
    Date(NaiveDate),
    Tag(Tag),
    /// Encoded text, decoded on access through a [`TextCodec`]
    Text(Vec<u8>),
    Binary(ValueBuffer),
}

/// The value held by a data element.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Single(Primitive),
    Multi(Vec<Primitive>),
    Sequence(Vec<Item>),
    Fragments(Vec<ValueBuffer>),
}

/// A nested dataset, kept in tag order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Item {
    elements: BTreeMap<Tag, DataElement>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an element, returning the one it replaced.
    pub fn put(&mut self, element: DataElement) -> Option<DataElement> {
        self.elements.insert(element.tag(), element)
    }

    pub fn get(&self, tag: Tag) -> Option<&DataElement> {
        self.elements.get(&tag)
    }

    pub fn remove(&mut self, tag: Tag) -> Option<DataElement> {
        self.elements.remove(&tag)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over the elements in ascending tag order.
    pub fn iter(&self) -> impl Iterator<Item = &DataElement> {
        self.elements.values()
    }
}

/// One tagged value cell.
#[derive(Debug, Clone, PartialEq)]
pub struct DataElement {
    tag: Tag,
    vr: VR,
    value: Value,
    length: Length,
}

impl Tagged for DataElement {
    fn tag(&self) -> Tag {
        self.tag
    }
}

impl DataElement {
    /// Create a data element.
    ///
    /// The length is derived from the value:
    /// sequences and fragments have an undefined length,
    /// other values the total byte size of their primitives,
    /// which must fit a defined 32-bit length.
    pub fn new(tag: Tag, vr: VR, value: Value) -> Result<Self> {
        let length = match &value {
            Value::Empty => Length::defined(0),
            Value::Single(p) => defined_length(tag, [primitive_size(p)])?,
            Value::Multi(ps) => defined_length(tag, ps.iter().map(primitive_size))?,
            Value::Sequence(_) | Value::Fragments(_) => Length::UNDEFINED,
        };
        Ok(DataElement {
            tag,
            vr,
            value,
            length,
        })
    }

    pub fn empty(tag: Tag, vr: VR) -> Self {
        DataElement {
            tag,
            vr,
            value: Value::Empty,
            length: Length::defined(0),
        }
    }

    /// Override the recorded value length,
    /// as read from an encoded element header.
    pub fn with_length(mut self, length: Length) -> Self {
        self.length = length;
        self
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn vr(&self) -> VR {
        self.vr
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The value length in bytes,
    /// [`Length::UNDEFINED`] if it is not known.
    pub fn length(&self) -> Length {
        self.length
    }

    /// The value multiplicity.
    pub fn vm(&self) -> usize {
        match &self.value {
            Value::Empty => 0,
            Value::Single(_) => 1,
            Value::Multi(ps) => ps.len(),
            Value::Sequence(items) => items.len(),
            Value::Fragments(fragments) => fragments.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vm() == 0
    }

    fn unsupported<T>(&self, operation: &'static str) -> Result<T> {
        UnsupportedSnafu {
            operation,
            element: self.to_string(),
        }
        .fail()
    }

    fn primitive_at(&self, operation: &'static str, index: usize) -> Result<&Primitive> {
        match &self.value {
            Value::Single(p) if index == 0 => Ok(p),
            Value::Single(_) => IndexOutOfBoundsSnafu {
                index,
                element: self.to_string(),
            }
            .fail(),
            Value::Multi(ps) => ps.get(index).context(IndexOutOfBoundsSnafu {
                index,
                element: self.to_string(),
            }),
            _ => self.unsupported(operation),
        }
    }

    fn primitives(&self, operation: &'static str) -> Result<&[Primitive]> {
        match &self.value {
            Value::Single(p) => Ok(std::slice::from_ref(p)),
            Value::Multi(ps) => Ok(ps),
            _ => self.unsupported(operation),
        }
    }

    pub fn int(&self) -> Result<i32> {
        self.int_at(0)
    }

    pub fn int_at(&self, index: usize) -> Result<i32> {
        match self.primitive_at("int", index)? {
            Primitive::Int(v) => Ok(*v),
            _ => self.unsupported("int"),
        }
    }

    pub fn ints(&self) -> Result<Vec<i32>> {
        self.primitives("ints")?
            .iter()
            .map(|p| match p {
                Primitive::Int(v) => Ok(*v),
                _ => self.unsupported("ints"),
            })
            .collect()
    }

    pub fn float(&self) -> Result<f32> {
        self.float_at(0)
    }

    pub fn float_at(&self, index: usize) -> Result<f32> {
        match self.primitive_at("float", index)? {
            Primitive::Float(v) => Ok(*v),
            _ => self.unsupported("float"),
        }
    }

    pub fn floats(&self) -> Result<Vec<f32>> {
        self.primitives("floats")?
            .iter()
            .map(|p| match p {
                Primitive::Float(v) => Ok(*v),
                _ => self.unsupported("floats"),
            })
            .collect()
    }

    pub fn double(&self) -> Result<f64> {
        self.double_at(0)
    }

    pub fn double_at(&self, index: usize) -> Result<f64> {
        match self.primitive_at("double", index)? {
            Primitive::Double(v) => Ok(*v),
            _ => self.unsupported("double"),
        }
    }

    pub fn doubles(&self) -> Result<Vec<f64>> {
        self.primitives("doubles")?
            .iter()
            .map(|p| match p {
                Primitive::Double(v) => Ok(*v),
                _ => self.unsupported("doubles"),
            })
            .collect()
    }

    pub fn date(&self) -> Result<NaiveDate> {
        self.date_at(0)
    }

    pub fn date_at(&self, index: usize) -> Result<NaiveDate> {
        match self.primitive_at("date", index)? {
            Primitive::Date(v) => Ok(*v),
            _ => self.unsupported("date"),
        }
    }

    pub fn dates(&self) -> Result<Vec<NaiveDate>> {
        self.primitives("dates")?
            .iter()
            .map(|p| match p {
                Primitive::Date(v) => Ok(*v),
                _ => self.unsupported("dates"),
            })
            .collect()
    }

    /// Retrieve an attribute tag held as a value (VR AT).
    pub fn tag_value_at(&self, index: usize) -> Result<Tag> {
        match self.primitive_at("tag value", index)? {
            Primitive::Tag(v) => Ok(*v),
            _ => self.unsupported("tag value"),
        }
    }

    pub fn tag_values(&self) -> Result<Vec<Tag>> {
        self.primitives("tag values")?
            .iter()
            .map(|p| match p {
                Primitive::Tag(v) => Ok(*v),
                _ => self.unsupported("tag values"),
            })
            .collect()
    }

    /// The string form of the first value.
    pub fn string(&self, codec: &dyn TextCodec) -> Result<String> {
        self.string_at(0, codec)
    }

    /// The string form of the value at `index`.
    ///
    /// Text is decoded with the given codec.
    /// Binary values have no string form.
    pub fn string_at(&self, index: usize, codec: &dyn TextCodec) -> Result<String> {
        let primitive = self.primitive_at("string", index)?;
        self.primitive_string(primitive, codec)
    }

    pub fn strings(&self, codec: &dyn TextCodec) -> Result<Vec<String>> {
        self.primitives("strings")?
            .iter()
            .map(|p| self.primitive_string(p, codec))
            .collect()
    }

    /// All values joined by a backslash,
    /// cut down to at most `max` characters.
    pub fn bounded_string(&self, max: usize, codec: &dyn TextCodec) -> Result<String> {
        let joined = self.strings(codec)?.join("\\");
        Ok(joined.chars().take(max).collect())
    }

    fn primitive_string(&self, primitive: &Primitive, codec: &dyn TextCodec) -> Result<String> {
        match primitive {
            Primitive::Int(v) => Ok(v.to_string()),
            Primitive::Float(v) => Ok(v.to_string()),
            Primitive::Double(v) => Ok(v.to_string()),
            Primitive::Date(v) => Ok(v.format("%Y%m%d").to_string()),
            Primitive::Tag(v) => Ok(v.to_string()),
            Primitive::Text(bytes) => codec
                .decode(bytes)
                .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
                .map_err(|e| {
                    DecodeTextSnafu {
                        element: self.to_string(),
                        message: e.to_string(),
                    }
                    .build()
                }),
            Primitive::Binary(_) => self.unsupported("string"),
        }
    }

    /// The raw buffer of a binary value.
    pub fn byte_buffer(&self) -> Result<&ValueBuffer> {
        match &self.value {
            Value::Single(Primitive::Binary(buf)) => Ok(buf),
            _ => self.unsupported("byte buffer"),
        }
    }

    pub fn byte_buffer_mut(&mut self) -> Result<&mut ValueBuffer> {
        let DataElement {
            tag,
            vr,
            value,
            length,
        } = self;
        match value {
            Value::Single(Primitive::Binary(buf)) => Ok(buf),
            other => UnsupportedSnafu {
                operation: "byte buffer",
                element: summary(*tag, *vr, other, *length),
            }
            .fail(),
        }
    }

    /// A copy of the binary value in the requested byte order.
    ///
    /// Units are swapped by the size implied by the value representation.
    /// Byte-sized representations are copied as they are.
    pub fn byte_buffer_in(&self, order: ByteOrder) -> Result<ValueBuffer> {
        let mut buf = self.byte_buffer()?.clone();
        if buf.order() != order {
            match swap_unit(self.vr) {
                Some(unit) => buf.swap(unit).context(SwapValueSnafu {
                    element: self.to_string(),
                })?,
                None => buf = ValueBuffer::new(buf.into_bytes(), order),
            }
        }
        Ok(buf)
    }

    pub fn has_items(&self) -> bool {
        matches!(self.value, Value::Sequence(_))
    }

    pub fn items(&self) -> Result<&[Item]> {
        match &self.value {
            Value::Sequence(items) => Ok(items),
            _ => self.unsupported("items"),
        }
    }

    pub fn item(&self, index: usize) -> Result<&Item> {
        let items = self.items()?;
        items.get(index).context(IndexOutOfBoundsSnafu {
            index,
            element: self.to_string(),
        })
    }

    pub fn add_item(&mut self, item: Item) -> Result<()> {
        if let Value::Sequence(items) = &mut self.value {
            items.push(item);
            return Ok(());
        }
        self.unsupported("add item")
    }

    /// Append an empty item and return it for filling in.
    pub fn add_new_item(&mut self) -> Result<&mut Item> {
        let DataElement {
            tag,
            vr,
            value,
            length,
        } = self;
        match value {
            Value::Sequence(items) => {
                items.push(Item::new());
                let last = items.len() - 1;
                Ok(&mut items[last])
            }
            other => UnsupportedSnafu {
                operation: "add item",
                element: summary(*tag, *vr, other, *length),
            }
            .fail(),
        }
    }

    pub fn has_fragments(&self) -> bool {
        matches!(self.value, Value::Fragments(_))
    }

    pub fn fragments(&self) -> Result<&[ValueBuffer]> {
        match &self.value {
            Value::Fragments(fragments) => Ok(fragments),
            _ => self.unsupported("fragments"),
        }
    }

    pub fn fragment(&self, index: usize) -> Result<&ValueBuffer> {
        let fragments = self.fragments()?;
        fragments.get(index).context(IndexOutOfBoundsSnafu {
            index,
            element: self.to_string(),
        })
    }

    pub fn fragment_len(&self, index: usize) -> Result<usize> {
        self.fragment(index).map(ValueBuffer::len)
    }

    pub fn add_fragment(&mut self, fragment: ValueBuffer) -> Result<()> {
        if let Value::Fragments(fragments) = &mut self.value {
            fragments.push(fragment);
            return Ok(());
        }
        self.unsupported("add fragment")
    }
}

impl fmt::Display for DataElement {
    /// `(GGGG,EEEE),VR,*vm,#length,[preview]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&summary(self.tag, self.vr, &self.value, self.length))
    }
}

fn summary(tag: Tag, vr: VR, value: &Value, length: Length) -> String {
    let vm = match value {
        Value::Empty => 0,
        Value::Single(_) => 1,
        Value::Multi(ps) => ps.len(),
        Value::Sequence(items) => items.len(),
        Value::Fragments(fragments) => fragments.len(),
    };
    let length = match length.get() {
        Some(len) => len.to_string(),
        None => "-1".to_string(),
    };
    format!("{},{},*{},#{},[{}]", tag, vr, vm, length, preview(value))
}

/// A bounded, human readable rendition of the value.
fn preview(value: &Value) -> String {
    let text = match value {
        Value::Empty => String::new(),
        Value::Sequence(items) => format!("{} items", items.len()),
        Value::Fragments(fragments) => format!("{} fragments", fragments.len()),
        Value::Single(p) => preview_primitive(p),
        Value::Multi(ps) => ps
            .iter()
            .map(preview_primitive)
            .collect::<Vec<_>>()
            .join("\\"),
    };
    text.chars().take(PREVIEW_LENGTH).collect()
}

fn preview_primitive(primitive: &Primitive) -> String {
    match primitive {
        Primitive::Int(v) => v.to_string(),
        Primitive::Float(v) => v.to_string(),
        Primitive::Double(v) => v.to_string(),
        Primitive::Date(v) => v.format("%Y%m%d").to_string(),
        Primitive::Tag(v) => v.to_string(),
        Primitive::Text(bytes) => DefaultCharacterSetCodec
            .decode(bytes)
            .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned()),
        Primitive::Binary(buf) => buf
            .as_bytes()
            .iter()
            // no more than needed to fill the preview
            .take(PREVIEW_LENGTH / 3 + 1)
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join("\\"),
    }
}

fn primitive_size(primitive: &Primitive) -> usize {
    match primitive {
        Primitive::Int(_) | Primitive::Float(_) | Primitive::Tag(_) => 4,
        Primitive::Double(_) => 8,
        Primitive::Date(_) => 8,
        Primitive::Text(bytes) => bytes.len(),
        Primitive::Binary(buf) => buf.len(),
    }
}

/// The total of the given sizes as a defined length.
///
/// 0xFFFF_FFFF is taken by the undefined length.
fn defined_length(tag: Tag, sizes: impl IntoIterator<Item = usize>) -> Result<Length> {
    let size = sizes
        .into_iter()
        .try_fold(0u64, |total, size| total.checked_add(u64::try_from(size).ok()?));
    size.and_then(|size| u32::try_from(size).ok())
        .filter(|&len| len != u32::MAX)
        .map(Length::defined)
        .context(ValueTooLongSnafu {
            tag,
            size: size.unwrap_or(u64::MAX),
        })
}

/// The byte swapping unit for values of the given representation,
/// `None` for byte-sized or textual representations.
pub fn swap_unit(vr: VR) -> Option<usize> {
    match vr {
        VR::OW | VR::US | VR::SS | VR::AT => Some(2),
        VR::OL | VR::UL | VR::SL | VR::FL | VR::OF => Some(4),
        VR::OD | VR::FD | VR::OV | VR::SV | VR::UV => Some(8),
        _ => None,
    }
}
