//! Class and exception encoders.
//!
//! Each encapsulation carries an [`EncoderState`] matching its encoding; the
//! stateless [`Encoder10`] and [`Encoder11`] operate on that state through the
//! output stream.

mod v10;
mod v11;

pub(crate) use v10::{Encoder10, State10};
pub(crate) use v11::{Encoder11, State11};

use crate::error::{CodecError, Result};
use crate::exception::UserException;
use crate::optional::OptionalFormat;
use crate::output::OutputStream;
use crate::value::{ValueGraph, ValueId};
use crate::version::EncodingVersion;

/// Kind of hierarchy whose slices are being written or read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceKind {
    Value,
    Exception,
}

/// Slice flag bits of the 1.1 encoding
pub(crate) mod flags {
    pub const TYPE_ID_STRING: u8 = 1;
    pub const TYPE_ID_INDEX: u8 = 2;
    pub const TYPE_ID_COMPACT: u8 = 3;
    pub const TYPE_ID_MASK: u8 = 3;
    pub const HAS_OPTIONAL_MEMBERS: u8 = 4;
    pub const HAS_INDIRECTION_TABLE: u8 = 8;
    pub const HAS_SLICE_SIZE: u8 = 16;
    pub const IS_LAST_SLICE: u8 = 32;
}

/// Per-encapsulation encoder state
#[derive(Debug)]
pub(crate) enum EncoderState {
    V10(State10),
    V11(State11),
}

impl EncoderState {
    pub(crate) fn new(encoding: EncodingVersion) -> Self {
        if encoding == EncodingVersion::V1_0 {
            Self::V10(State10::default())
        } else {
            Self::V11(State11::default())
        }
    }

    /// Check that no instance, slice or pending value is left open
    pub(crate) fn check_finished(&self) -> Result<()> {
        match self {
            Self::V10(state) => state.check_finished(),
            Self::V11(state) => state.check_finished(),
        }
    }
}

/// Encoding of class instances, exceptions and optionals
pub(crate) trait InstanceEncoder {
    fn write_value(out: &mut OutputStream, graph: &ValueGraph, value: Option<ValueId>) -> Result<()>;

    fn write_pending_values(out: &mut OutputStream, graph: &ValueGraph) -> Result<()>;

    fn write_exception(out: &mut OutputStream, exception: &dyn UserException) -> Result<()>;

    fn start_slice(out: &mut OutputStream, type_id: &str, compact_id: Option<i32>, last: bool) -> Result<()>;

    fn end_slice(out: &mut OutputStream, graph: Option<&ValueGraph>) -> Result<()>;

    fn write_optional(out: &mut OutputStream, tag: i32, format: OptionalFormat) -> Result<bool>;
}

/// Assign type IDs a per-encapsulation index on first use.
///
/// Returns `None` the first time a type ID is seen (it must be written as a
/// string) and its index afterwards.
pub(crate) fn register_type_id(
    table: &mut std::collections::HashMap<String, usize>,
    type_id: &str,
) -> Option<usize> {
    if let Some(index) = table.get(type_id) {
        return Some(*index);
    }
    let index = table.len() + 1;
    table.insert(type_id.to_string(), index);
    None
}

pub(crate) fn state_mismatch() -> CodecError {
    CodecError::misuse("encoder state does not match the encapsulation encoding")
}
