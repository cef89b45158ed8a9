//! SCP/SCU role selection negotiation sub-item (item type 54H).
//!
//! The sub-item is carried in the user information item
//! of A-ASSOCIATE-RQ and A-ASSOCIATE-AC PDUs:
//!
//! | bytes | field                                   |
//! |-------|-----------------------------------------|
//! | 1     | item type (54H)                         |
//! | 1     | reserved (00H)                          |
//! | 2     | item length, big endian (UID length + 4) |
//! | 2     | UID length, big endian                  |
//! | n     | SOP class UID                           |
//! | 1     | SCU role                                |
//! | 1     | SCP role                                |
//!
//! The PDU reader of `dicom-ul` surfaces this sub-item
//! as [`UserVariableItem::Unknown`],
//! holding the bytes that follow the item length.
use byteordered::byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use dicom_ul::pdu::{AbortRQServiceProviderReason, AbortRQSource, UserVariableItem};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, Read, Write};

/// The item type of the role selection sub-item.
pub const ITEM_TYPE: u8 = 0x54;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "role selection item length {} does not match UID length {} + 4",
        item_length,
        uid_length
    ))]
    LengthMismatch {
        item_length: usize,
        uid_length: u16,
        backtrace: Backtrace,
    },
    #[snafu(display("unexpected item type {:#04x}", item_type))]
    UnexpectedItemType { item_type: u8, backtrace: Backtrace },
    #[snafu(display("could not read role selection field `{}`", field))]
    ReadField {
        field: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("could not write role selection field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("abstract syntax UID of {} bytes is too long", length))]
    UidTooLong { length: usize, backtrace: Backtrace },
}

impl Error {
    /// The A-ABORT source to report when decoding failed.
    ///
    /// Every decoding failure means the peer sent an inconsistent sub-item,
    /// so the association must be aborted
    /// with an invalid PDU parameter value.
    /// Encoding failures are local and have no abort source.
    pub fn abort_source(&self) -> Option<AbortRQSource> {
        match self {
            Error::LengthMismatch { .. }
            | Error::UnexpectedItemType { .. }
            | Error::ReadField { .. } => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            Error::WriteField { .. } | Error::UidTooLong { .. } => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The roles negotiated for one abstract syntax.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleSelection {
    /// the SOP class UID
    pub abstract_syntax: String,
    /// whether the association requester may act as SCU
    pub scu: bool,
    /// whether the association requester may act as SCP
    pub scp: bool,
}

impl RoleSelection {
    pub fn new(abstract_syntax: impl Into<String>, scu: bool, scp: bool) -> Self {
        RoleSelection {
            abstract_syntax: abstract_syntax.into(),
            scu,
            scp,
        }
    }

    /// The value of the item length field.
    pub fn item_length(&self) -> usize {
        self.abstract_syntax.len() + 4
    }

    /// Write the whole sub-item, header included.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let item_length = u16::try_from(self.item_length()).ok().context(UidTooLongSnafu {
            length: self.abstract_syntax.len(),
        })?;
        writer
            .write_u8(ITEM_TYPE)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteFieldSnafu { field: "Reserved" })?;
        writer
            .write_u16::<BigEndian>(item_length)
            .context(WriteFieldSnafu {
                field: "Item-length",
            })?;
        self.write_body(writer)
    }

    /// Encode the whole sub-item, header included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.item_length() + 4);
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    fn write_body<W: Write>(&self, writer: &mut W) -> Result<()> {
        let uid_length = u16::try_from(self.abstract_syntax.len())
            .ok()
            .context(UidTooLongSnafu {
                length: self.abstract_syntax.len(),
            })?;
        writer
            .write_u16::<BigEndian>(uid_length)
            .context(WriteFieldSnafu {
                field: "UID-length",
            })?;
        writer
            .write_all(self.abstract_syntax.as_bytes())
            .context(WriteFieldSnafu {
                field: "SOP-class-uid",
            })?;
        writer
            .write_u8(self.scu as u8)
            .context(WriteFieldSnafu { field: "SCU-role" })?;
        writer
            .write_u8(self.scp as u8)
            .context(WriteFieldSnafu { field: "SCP-role" })?;
        Ok(())
    }

    /// Read the sub-item body,
    /// given the item length declared in its header.
    pub fn read_from<R: Read>(reader: &mut R, item_length: usize) -> Result<Self> {
        let uid_length = reader.read_u16::<BigEndian>().context(ReadFieldSnafu {
            field: "UID-length",
        })?;
        ensure!(
            item_length == usize::from(uid_length) + 4,
            LengthMismatchSnafu {
                item_length,
                uid_length,
            }
        );
        let mut uid = vec![0; usize::from(uid_length)];
        reader.read_exact(&mut uid).context(ReadFieldSnafu {
            field: "SOP-class-uid",
        })?;
        let scu = reader
            .read_u8()
            .context(ReadFieldSnafu { field: "SCU-role" })?;
        let scp = reader
            .read_u8()
            .context(ReadFieldSnafu { field: "SCP-role" })?;
        let abstract_syntax = String::from_utf8_lossy(&uid)
            .trim_end_matches(['\0', ' '])
            .to_string();
        Ok(RoleSelection {
            abstract_syntax,
            scu: scu != 0,
            scp: scp != 0,
        })
    }

    /// Decode a whole sub-item, header included.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let item_type = reader.read_u8().context(ReadFieldSnafu {
            field: "Item-type",
        })?;
        ensure!(item_type == ITEM_TYPE, UnexpectedItemTypeSnafu { item_type });
        reader
            .read_u8()
            .context(ReadFieldSnafu { field: "Reserved" })?;
        let item_length = reader.read_u16::<BigEndian>().context(ReadFieldSnafu {
            field: "Item-length",
        })?;
        Self::read_from(&mut reader, usize::from(item_length))
    }

    /// Wrap this sub-item as a user variable for the PDU writer.
    pub fn to_user_variable(&self) -> Result<UserVariableItem> {
        let mut body = Vec::with_capacity(self.item_length());
        self.write_body(&mut body)?;
        Ok(UserVariableItem::Unknown(ITEM_TYPE, body))
    }

    /// Recover a role selection from a user variable read by the PDU reader.
    ///
    /// Returns `None` if the user variable is something else.
    pub fn from_user_variable(item: &UserVariableItem) -> Option<Result<Self>> {
        match item {
            UserVariableItem::Unknown(ITEM_TYPE, body) => {
                Some(Self::read_from(&mut Cursor::new(body), body.len()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn encode_layout() {
        let item = RoleSelection::new("1.2.3", true, false);
        let bytes = item.to_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x54, 0x00, // type, reserved
                0x00, 0x09, // item length
                0x00, 0x05, // uid length
                b'1', b'.', b'2', b'.', b'3', // uid
                0x01, 0x00, // roles
            ]
        );
    }

    #[rstest]
    #[case("1.2.840.10008.5.1.4.1.1.2", true, true)]
    #[case("1.2.840.10008.5.1.4.1.1.4", false, true)]
    #[case("1.2.840.10008.1.1", true, false)]
    #[case("1", false, false)]
    fn decode_encoded(#[case] uid: &str, #[case] scu: bool, #[case] scp: bool) {
        let item = RoleSelection::new(uid, scu, scp);
        let bytes = item.to_bytes().unwrap();
        assert_eq!(bytes.len(), item.item_length() + 4);
        assert_eq!(RoleSelection::decode(&bytes).unwrap(), item);

        let user_variable = item.to_user_variable().unwrap();
        let back = RoleSelection::from_user_variable(&user_variable)
            .unwrap()
            .unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn declared_length_must_match() {
        // UID length 4, but an item length of 7
        let bytes = [
            0x54, 0x00, 0x00, 0x07, 0x00, 0x04, b'1', b'.', b'2', b'3', 0x01, 0x01,
        ];
        let err = RoleSelection::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::LengthMismatch {
                item_length: 7,
                uid_length: 4,
                ..
            }
        ));
        assert_eq!(
            err.abort_source(),
            Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter
            ))
        );
    }

    #[test]
    fn inconsistent_user_variable() {
        // body declares a 5-byte UID in a 6-byte item
        let item = UserVariableItem::Unknown(ITEM_TYPE, vec![0x00, 0x05, b'1', b'.', 0x01, 0x00]);
        let err = RoleSelection::from_user_variable(&item).unwrap().unwrap_err();
        assert!(err.abort_source().is_some());
    }

    #[test]
    fn truncated_item() {
        let bytes = [0x54, 0x00, 0x00, 0x09, 0x00, 0x05, b'1', b'.'];
        let err = RoleSelection::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::ReadField { .. }));
        assert!(err.abort_source().is_some());
    }

    #[test]
    fn other_user_variables_are_ignored() {
        assert!(RoleSelection::from_user_variable(&UserVariableItem::MaxLength(16384)).is_none());
        assert!(
            RoleSelection::from_user_variable(&UserVariableItem::Unknown(0x53, vec![0; 4]))
                .is_none()
        );
    }
}
