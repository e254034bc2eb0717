//! User exceptions carried in failure replies.

use std::any::Any;
use std::fmt;

use crate::error::Result;
use crate::input::InputStream;
use crate::output::OutputStream;
use crate::value::ValueGraph;

/// A marshalable user exception.
///
/// Like class instances, exceptions are encoded as one slice per level of
/// their hierarchy, most derived first. Class members are written with
/// [`OutputStream::write_value`] against the graph returned by
/// [`UserException::values`].
pub trait UserException: Any + Send + fmt::Debug {
    /// Most-derived type ID
    fn type_name(&self) -> &str;

    /// Encode all slices
    fn write(&self, out: &mut OutputStream) -> Result<()>;

    /// Decode all known slices
    fn read(&mut self, input: &mut InputStream<'_>) -> Result<()>;

    /// Instances referenced by class members, needed by the 1.0 encoding
    /// which writes them after the exception
    fn values(&self) -> Option<&ValueGraph> {
        None
    }

    /// Upcast for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Exception none of whose slices had a registered factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnknownUserException {
    /// Most-derived type ID found on the wire
    pub type_id: String,
}

impl UserException for UnknownUserException {
    fn type_name(&self) -> &str {
        &self.type_id
    }

    fn write(&self, _out: &mut OutputStream) -> Result<()> {
        Err(crate::CodecError::misuse(
            "an unknown user exception cannot be re-encoded",
        ))
    }

    fn read(&mut self, _input: &mut InputStream<'_>) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Display for UnknownUserException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown user exception `{}`", self.type_id)
    }
}
