//! Data set encoding boundary.
//!
//! Data sets are decoded and encoded by `dicom-object`
//! in the transfer syntax negotiated for their presentation context.
//! Command sets are always in implicit VR little endian.
use crate::transfer;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Read, Write};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("unknown transfer syntax `{}`", uid))]
    UnknownTransferSyntax { uid: String, backtrace: Backtrace },
    #[snafu(display("could not read data set in transfer syntax {}", uid))]
    ReadDataset { uid: String, source: BoxError },
    #[snafu(display("could not write data set in transfer syntax {}", uid))]
    WriteDataset { uid: String, source: BoxError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Decode a data set from the given source.
pub fn read_dataset<R: Read>(from: R, transfer_syntax: &str) -> Result<InMemDicomObject> {
    let ts = transfer::lookup(transfer_syntax).context(UnknownTransferSyntaxSnafu {
        uid: transfer_syntax,
    })?;
    InMemDicomObject::read_dataset_with_ts(from, ts)
        .map_err(|e| Box::new(e) as BoxError)
        .context(ReadDatasetSnafu {
            uid: transfer_syntax,
        })
}

/// Encode a data set into the given sink.
pub fn write_dataset<W: Write>(
    obj: &InMemDicomObject,
    to: W,
    transfer_syntax: &str,
) -> Result<()> {
    let ts = transfer::lookup(transfer_syntax).context(UnknownTransferSyntaxSnafu {
        uid: transfer_syntax,
    })?;
    obj.write_dataset_with_ts(to, ts)
        .map_err(|e| Box::new(e) as BoxError)
        .context(WriteDatasetSnafu {
            uid: transfer_syntax,
        })
}

/// Decode a command set.
pub fn read_command<R: Read>(from: R) -> Result<InMemDicomObject> {
    let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(from, &ts)
        .map_err(|e| Box::new(e) as BoxError)
        .context(ReadDatasetSnafu { uid: ts.uid() })
}

/// Encode a command set.
pub fn write_command<W: Write>(obj: &InMemDicomObject, to: W) -> Result<()> {
    let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
    obj.write_dataset_with_ts(to, &ts)
        .map_err(|e| Box::new(e) as BoxError)
        .context(WriteDatasetSnafu { uid: ts.uid() })
}
