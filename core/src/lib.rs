#![deny(trivial_numeric_casts, unsafe_code, unstable_features)]
#![warn(
    missing_debug_implementations,
    unused_qualifications,
    unused_import_braces
)]

//! Core data structures for exchanging DICOM messages.
//!
//! - [`order`] defines the total order of tagged values,
//!   in which data elements and presentation contexts are kept.
//! - [`buffer`] holds value buffers tagged with their byte order,
//!   and the in-place byte swapping routines over them.
//! - [`element`] describes a single data element cell,
//!   with explicit capability checks over its value variant.
//!
//! Tag and value representation identities are those of [`dicom_core`],
//! which is re-exported for convenience.

pub mod buffer;
pub mod element;
pub mod order;

pub use buffer::{ByteOrder, ValueBuffer};
pub use element::{DataElement, Item, Primitive, Value};
pub use order::{compare, Tagged};

// re-export crates that are part of the public API
pub use chrono;
pub use dicom_core;
pub use dicom_core::{Length, Tag, VR};
