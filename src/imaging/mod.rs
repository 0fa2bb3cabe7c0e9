//! Volumetric image I/O.
//!
//! Thin adapter over the NIfTI container: load uploads, save results, and
//! read the label table that multilabel segmentations carry in a header
//! extension.

mod codec;
mod error;
mod label_map;

pub use codec::{
    DEFAULT_MAX_DECODED_SIZE, RawExtension, VolumeImage, load, load_multilabel, save, save_as,
};
pub use error::{CodecError, CodecResult};
pub use label_map::{LABEL_TABLE_ECODE, LabelMap};
