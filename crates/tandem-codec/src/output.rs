//! Output stream: serializes values into a growable buffer.
//!
//! All fixed-width primitives are little-endian. Sizes use one byte up to
//! 254 and `0xFF` followed by an `i32` above that.
//!
//! Length-prefixed regions (encapsulations, slices, `FSize` optionals) are
//! written with a [`Placeholder`]: four bytes are reserved when the region
//! starts and patched with the real length when it ends.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoder::{Encoder10, Encoder11, EncoderState, InstanceEncoder};
use crate::error::{CodecError, Result};
use crate::exception::UserException;
use crate::optional::OptionalFormat;
use crate::proxy::ProxyData;
use crate::value::{ValueGraph, ValueId};
use crate::varint;
use crate::version::{EncodingVersion, FormatType};

/// Size of an encapsulation header: `i32` length plus two version bytes
pub const ENCAPSULATION_HEADER_SIZE: usize = 6;

/// Largest size that fits in the one-byte size form
pub const MAX_SHORT_SIZE: usize = 254;

/// Four reserved bytes awaiting a length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a placeholder must be patched"]
pub struct Placeholder {
    pos: usize,
}

impl Placeholder {
    /// Offset of the reserved bytes in the stream
    pub fn position(self) -> usize {
        self.pos
    }
}

/// State of one (possibly implicit) encapsulation being written
#[derive(Debug)]
pub(crate) struct WriteEncaps {
    start: Option<Placeholder>,
    pub(crate) encoding: EncodingVersion,
    pub(crate) format: FormatType,
    pub(crate) state: EncoderState,
}

impl WriteEncaps {
    fn new(start: Option<Placeholder>, encoding: EncodingVersion, format: FormatType) -> Self {
        Self {
            start,
            encoding,
            format,
            state: EncoderState::new(encoding),
        }
    }
}

/// Serializes typed data into a byte buffer.
#[derive(Debug)]
pub struct OutputStream {
    buf: BytesMut,
    base: WriteEncaps,
    encaps: Vec<WriteEncaps>,
    // first size too large for the wire, reported by `finish`
    oversized: Option<usize>,
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new(EncodingVersion::default())
    }
}

/// Dispatch to the encoder of the current encapsulation's encoding
macro_rules! with_encoder {
    ($out:expr, $method:ident ( $($arg:expr),* )) => {
        if $out.current().encoding == EncodingVersion::V1_0 {
            Encoder10::$method($out, $($arg),*)
        } else {
            Encoder11::$method($out, $($arg),*)
        }
    };
}

impl OutputStream {
    /// Create a stream whose top level uses `encoding`
    #[must_use]
    pub fn new(encoding: EncodingVersion) -> Self {
        Self::with_format(encoding, FormatType::default())
    }

    /// Create a stream with an explicit class format
    #[must_use]
    pub fn with_format(encoding: EncodingVersion, format: FormatType) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            base: WriteEncaps::new(None, encoding, format),
            encaps: Vec::new(),
            oversized: None,
        }
    }

    pub(crate) fn current(&self) -> &WriteEncaps {
        self.encaps.last().unwrap_or(&self.base)
    }

    pub(crate) fn current_mut(&mut self) -> &mut WriteEncaps {
        match self.encaps.last_mut() {
            Some(encaps) => encaps,
            None => &mut self.base,
        }
    }

    /// Encoding of the innermost encapsulation
    #[must_use]
    pub fn encoding(&self) -> EncodingVersion {
        self.current().encoding
    }

    /// Class format of the innermost encapsulation
    #[must_use]
    pub fn format(&self) -> FormatType {
        self.current().format
    }

    /// Number of bytes written
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check whether nothing was written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes written so far
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of encapsulations started and not yet ended
    #[must_use]
    pub fn encapsulation_depth(&self) -> usize {
        self.encaps.len()
    }

    /// Finish writing and take the buffer.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidSize` if a size larger than `i32::MAX`
    /// was written, and `CodecError::Misuse` if an encapsulation is still
    /// open.
    pub fn finish(self) -> Result<Bytes> {
        self.check_sizes()?;
        if !self.encaps.is_empty() {
            return Err(CodecError::misuse(format!(
                "{} encapsulation(s) not ended",
                self.encaps.len()
            )));
        }
        Ok(self.buf.freeze())
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Write one byte
    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Write a boolean as one byte
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Write a 16-bit integer
    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    /// Write a 32-bit integer
    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    /// Write a 64-bit integer
    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    /// Write a 32-bit float
    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    /// Write a 64-bit float
    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    /// Append raw bytes with no size prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a size: one byte up to 254, else `0xFF` and an `i32`.
    ///
    /// A size above `i32::MAX` cannot be encoded; it is written as
    /// `i32::MAX` and fails the next `end_encapsulation` or `finish`.
    pub fn write_size(&mut self, size: usize) {
        if size <= MAX_SHORT_SIZE {
            self.buf.put_u8(size as u8);
            return;
        }
        let wire = match i32::try_from(size) {
            Ok(wire) => wire,
            Err(_) => {
                self.oversized.get_or_insert(size);
                i32::MAX
            }
        };
        self.buf.put_u8(0xFF);
        self.buf.put_i32_le(wire);
    }

    fn check_sizes(&self) -> Result<()> {
        match self.oversized {
            Some(size) => Err(CodecError::InvalidSize(i64::try_from(size).unwrap_or(i64::MAX))),
            None => Ok(()),
        }
    }

    /// Write a variable-length unsigned integer (1, 2, 4 or 8 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidData` if `value` needs more than 62 bits.
    pub fn write_varulong(&mut self, value: u64) -> Result<()> {
        varint::encode_varulong(value, &mut self.buf)
    }

    /// Write a size-prefixed UTF-8 string
    pub fn write_string(&mut self, value: &str) {
        self.write_size(value.len());
        self.buf.put_slice(value.as_bytes());
    }

    // ------------------------------------------------------------------
    // Placeholders
    // ------------------------------------------------------------------

    /// Reserve four bytes to be patched later
    pub fn reserve_placeholder(&mut self) -> Placeholder {
        let pos = self.buf.len();
        self.buf.put_i32_le(0);
        Placeholder { pos }
    }

    /// Patch a placeholder with an explicit value
    pub fn patch_placeholder(&mut self, placeholder: Placeholder, value: i32) {
        self.rewrite(placeholder.pos, &value.to_le_bytes());
    }

    /// Patch a placeholder with the number of bytes written since it was
    /// reserved, counting its own four bytes when `include_self` is set.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidSize` if the region exceeds `i32::MAX`.
    pub fn finish_placeholder(&mut self, placeholder: Placeholder, include_self: bool) -> Result<()> {
        let mut length = self.buf.len() - placeholder.pos;
        if !include_self {
            length -= 4;
        }
        let length = i32::try_from(length).map_err(|_| CodecError::InvalidSize(length as i64))?;
        self.patch_placeholder(placeholder, length);
        Ok(())
    }

    pub(crate) fn rewrite(&mut self, pos: usize, bytes: &[u8]) {
        self.buf[pos..pos + bytes.len()].copy_from_slice(bytes);
    }

    // ------------------------------------------------------------------
    // Encapsulations
    // ------------------------------------------------------------------

    /// Begin an encapsulation: placeholder length and version tag.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnsupportedEncoding` for an unknown encoding.
    pub fn start_encapsulation(&mut self, encoding: EncodingVersion, format: FormatType) -> Result<()> {
        if !encoding.is_supported() {
            return Err(CodecError::UnsupportedEncoding(encoding));
        }
        let start = self.reserve_placeholder();
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        self.encaps
            .push(WriteEncaps::new(Some(start), encoding, format));
        Ok(())
    }

    /// End the innermost encapsulation and patch its length.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidSize` if a size larger than `i32::MAX`
    /// was written. Returns `CodecError::Misuse` if no encapsulation is
    /// open, if an instance or slice is still open, or if 1.0 pending
    /// instances were never written.
    pub fn end_encapsulation(&mut self) -> Result<()> {
        self.check_sizes()?;
        let encaps = self
            .encaps
            .pop()
            .ok_or_else(|| CodecError::misuse("no encapsulation to end"))?;
        encaps.state.check_finished()?;
        let start = encaps
            .start
            .ok_or_else(|| CodecError::misuse("implicit encapsulation cannot be ended"))?;
        self.finish_placeholder(start, true)
    }

    /// Write an encapsulation with no payload
    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.write_i32(ENCAPSULATION_HEADER_SIZE as i32);
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
    }

    /// Copy an already encoded encapsulation (header included).
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidEncapsulation` if the header does not
    /// match the byte count.
    pub fn write_encapsulation_bytes(&mut self, encapsulation: &[u8]) -> Result<()> {
        if encapsulation.len() < ENCAPSULATION_HEADER_SIZE {
            return Err(CodecError::InvalidEncapsulation(
                "encapsulation shorter than its header".into(),
            ));
        }
        let declared = i32::from_le_bytes([
            encapsulation[0],
            encapsulation[1],
            encapsulation[2],
            encapsulation[3],
        ]);
        if declared < 0 || declared as usize != encapsulation.len() {
            return Err(CodecError::InvalidEncapsulation(
                format!(
                    "declared size {declared} does not match {} bytes",
                    encapsulation.len()
                )
                .into(),
            ));
        }
        self.write_raw(encapsulation);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sequences and dictionaries
    // ------------------------------------------------------------------

    /// Write a byte sequence
    pub fn write_byte_seq(&mut self, values: &[u8]) {
        self.write_size(values.len());
        self.write_raw(values);
    }

    /// Write a boolean sequence
    pub fn write_bool_seq(&mut self, values: &[bool]) {
        self.write_size(values.len());
        for value in values {
            self.write_bool(*value);
        }
    }

    /// Write a 16-bit integer sequence
    pub fn write_i16_seq(&mut self, values: &[i16]) {
        self.write_size(values.len());
        for value in values {
            self.write_i16(*value);
        }
    }

    /// Write a 32-bit integer sequence
    pub fn write_i32_seq(&mut self, values: &[i32]) {
        self.write_size(values.len());
        for value in values {
            self.write_i32(*value);
        }
    }

    /// Write a 64-bit integer sequence
    pub fn write_i64_seq(&mut self, values: &[i64]) {
        self.write_size(values.len());
        for value in values {
            self.write_i64(*value);
        }
    }

    /// Write a 32-bit float sequence
    pub fn write_f32_seq(&mut self, values: &[f32]) {
        self.write_size(values.len());
        for value in values {
            self.write_f32(*value);
        }
    }

    /// Write a 64-bit float sequence
    pub fn write_f64_seq(&mut self, values: &[f64]) {
        self.write_size(values.len());
        for value in values {
            self.write_f64(*value);
        }
    }

    /// Write a string sequence
    pub fn write_string_seq<S: AsRef<str>>(&mut self, values: &[S]) {
        self.write_size(values.len());
        for value in values {
            self.write_string(value.as_ref());
        }
    }

    /// Write a sequence of arbitrary elements.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `write_element`.
    pub fn write_seq<T, F>(&mut self, values: &[T], mut write_element: F) -> Result<()>
    where
        F: FnMut(&mut Self, &T) -> Result<()>,
    {
        self.write_size(values.len());
        for value in values {
            write_element(self, value)?;
        }
        Ok(())
    }

    /// Write a dictionary from an exact-size iterator of entries.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `write_entry`.
    pub fn write_dict<I, F>(&mut self, entries: I, mut write_entry: F) -> Result<()>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut Self, I::Item) -> Result<()>,
    {
        let entries = entries.into_iter();
        self.write_size(entries.len());
        for entry in entries {
            write_entry(self, entry)?;
        }
        Ok(())
    }

    /// Write a string to string dictionary
    pub fn write_string_dict(&mut self, dict: &BTreeMap<String, String>) {
        self.write_size(dict.len());
        for (key, value) in dict {
            self.write_string(key);
            self.write_string(value);
        }
    }

    // ------------------------------------------------------------------
    // Enums and proxies
    // ------------------------------------------------------------------

    /// Write an enumerator.
    ///
    /// The 1.0 encoding picks the narrowest integer able to hold
    /// `max_value`; 1.1 writes a size.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidData` if `value` is outside
    /// `0..=max_value`.
    pub fn write_enum(&mut self, value: i32, max_value: i32) -> Result<()> {
        if !(0..=max_value).contains(&value) {
            return Err(CodecError::invalid(format!(
                "enumerator {value} out of range 0..={max_value}"
            )));
        }
        if self.encoding() == EncodingVersion::V1_0 {
            if max_value < 127 {
                self.write_u8(value as u8);
            } else if max_value < 32767 {
                self.write_i16(value as i16);
            } else {
                self.write_i32(value);
            }
        } else {
            self.write_size(value as usize);
        }
        Ok(())
    }

    /// Write a proxy, or the null proxy for `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if an endpoint encapsulation cannot be written.
    pub fn write_proxy(&mut self, proxy: Option<&ProxyData>) -> Result<()> {
        let Some(proxy) = proxy else {
            self.write_string("");
            self.write_string("");
            return Ok(());
        };
        if proxy.identity.is_null() {
            return Err(CodecError::misuse("proxy with a null identity"));
        }
        self.write_string(&proxy.identity.name);
        self.write_string(&proxy.identity.category);
        if proxy.facet.is_empty() {
            self.write_size(0);
        } else {
            self.write_size(1);
            self.write_string(&proxy.facet);
        }
        self.write_u8(proxy.mode as u8);
        self.write_bool(proxy.secure);
        if self.encoding() != EncodingVersion::V1_0 {
            self.write_u8(proxy.protocol.major);
            self.write_u8(proxy.protocol.minor);
            self.write_u8(proxy.encoding.major);
            self.write_u8(proxy.encoding.minor);
        }
        self.write_size(proxy.endpoints.len());
        for endpoint in &proxy.endpoints {
            self.write_i16(endpoint.transport);
            self.start_encapsulation(endpoint.encoding, FormatType::Compact)?;
            self.write_raw(&endpoint.body);
            self.end_encapsulation()?;
        }
        if proxy.endpoints.is_empty() {
            self.write_string(&proxy.adapter_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Optionals
    // ------------------------------------------------------------------

    /// Write an optional member header.
    ///
    /// Returns `false` when the current encoding has no optionals, in which
    /// case the caller must not write the value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Misuse` for a negative tag or an optional written
    /// outside a slice while an instance is being encoded.
    pub fn write_optional(&mut self, tag: i32, format: OptionalFormat) -> Result<bool> {
        if tag < 0 {
            return Err(CodecError::misuse(format!("negative optional tag {tag}")));
        }
        with_encoder!(self, write_optional(tag, format))
    }

    /// Write an optional boolean
    pub fn write_bool_opt(&mut self, tag: i32, value: Option<bool>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::F1)? {
                self.write_bool(value);
            }
        }
        Ok(())
    }

    /// Write an optional byte
    pub fn write_u8_opt(&mut self, tag: i32, value: Option<u8>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::F1)? {
                self.write_u8(value);
            }
        }
        Ok(())
    }

    /// Write an optional 16-bit integer
    pub fn write_i16_opt(&mut self, tag: i32, value: Option<i16>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::F2)? {
                self.write_i16(value);
            }
        }
        Ok(())
    }

    /// Write an optional 32-bit integer
    pub fn write_i32_opt(&mut self, tag: i32, value: Option<i32>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::F4)? {
                self.write_i32(value);
            }
        }
        Ok(())
    }

    /// Write an optional 64-bit integer
    pub fn write_i64_opt(&mut self, tag: i32, value: Option<i64>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::F8)? {
                self.write_i64(value);
            }
        }
        Ok(())
    }

    /// Write an optional 32-bit float
    pub fn write_f32_opt(&mut self, tag: i32, value: Option<f32>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::F4)? {
                self.write_f32(value);
            }
        }
        Ok(())
    }

    /// Write an optional 64-bit float
    pub fn write_f64_opt(&mut self, tag: i32, value: Option<f64>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::F8)? {
                self.write_f64(value);
            }
        }
        Ok(())
    }

    /// Write an optional string (its size prefix doubles as the `VSize`)
    pub fn write_string_opt(&mut self, tag: i32, value: Option<&str>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::VSize)? {
                self.write_string(value);
            }
        }
        Ok(())
    }

    /// Write an optional byte sequence
    pub fn write_byte_seq_opt(&mut self, tag: i32, value: Option<&[u8]>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::VSize)? {
                self.write_byte_seq(value);
            }
        }
        Ok(())
    }

    /// Write an optional 32-bit integer sequence, prefixed with its encoded size
    pub fn write_i32_seq_opt(&mut self, tag: i32, value: Option<&[i32]>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::VSize)? {
                let prefix = if value.len() > MAX_SHORT_SIZE { 5 } else { 1 };
                self.write_size(value.len() * 4 + prefix);
                self.write_i32_seq(value);
            }
        }
        Ok(())
    }

    /// Write an optional string sequence
    pub fn write_string_seq_opt<S: AsRef<str>>(&mut self, tag: i32, value: Option<&[S]>) -> Result<()> {
        if let Some(value) = value {
            self.write_fsize_opt(tag, |out| {
                out.write_string_seq(value);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Write an optional enumerator
    pub fn write_enum_opt(&mut self, tag: i32, value: Option<i32>, max_value: i32) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::Size)? {
                self.write_enum(value, max_value)?;
            }
        }
        Ok(())
    }

    /// Write an optional proxy
    pub fn write_proxy_opt(&mut self, tag: i32, value: Option<&ProxyData>) -> Result<()> {
        if let Some(value) = value {
            self.write_fsize_opt(tag, |out| out.write_proxy(Some(value)))?;
        }
        Ok(())
    }

    /// Write an optional whose body is framed by a four-byte size.
    ///
    /// # Errors
    ///
    /// Propagates errors from the header or from `write_body`.
    pub fn write_fsize_opt<F>(&mut self, tag: i32, write_body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.write_optional(tag, OptionalFormat::FSize)? {
            let size = self.reserve_placeholder();
            write_body(self)?;
            self.finish_placeholder(size, false)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Classes and exceptions
    // ------------------------------------------------------------------

    /// Write a class reference and, depending on the encoding, the instance.
    ///
    /// 1.0 queues the instance until [`write_pending_values`]; 1.1 writes it
    /// inline or through the current slice's indirection table.
    ///
    /// [`write_pending_values`]: OutputStream::write_pending_values
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Misuse` if `value` designates an empty slot.
    pub fn write_value(&mut self, graph: &ValueGraph, value: Option<ValueId>) -> Result<()> {
        with_encoder!(self, write_value(graph, value))
    }

    /// Write an optional class member
    pub fn write_value_opt(&mut self, graph: &ValueGraph, tag: i32, value: Option<ValueId>) -> Result<()> {
        if let Some(value) = value {
            if self.write_optional(tag, OptionalFormat::Class)? {
                self.write_value(graph, Some(value))?;
            }
        }
        Ok(())
    }

    /// Flush instances queued by the 1.0 encoding (no-op for 1.1)
    pub fn write_pending_values(&mut self, graph: &ValueGraph) -> Result<()> {
        with_encoder!(self, write_pending_values(graph))
    }

    /// Write a user exception
    pub fn write_exception(&mut self, exception: &dyn UserException) -> Result<()> {
        with_encoder!(self, write_exception(exception))
    }

    /// Begin one slice of the instance or exception being written
    pub fn start_slice(&mut self, type_id: &str, compact_id: Option<i32>, last: bool) -> Result<()> {
        with_encoder!(self, start_slice(type_id, compact_id, last))
    }

    /// End the current slice
    pub fn end_slice(&mut self) -> Result<()> {
        with_encoder!(self, end_slice(None))
    }
}

/// Output stream handed to [`Value::write`](crate::Value::write).
///
/// Dereferences to the [`OutputStream`] and additionally knows the graph the
/// instance lives in, so class members can be written by [`ValueId`].
pub struct InstanceWriter<'a> {
    out: &'a mut OutputStream,
    graph: &'a ValueGraph,
}

impl<'a> InstanceWriter<'a> {
    pub(crate) fn new(out: &'a mut OutputStream, graph: &'a ValueGraph) -> Self {
        Self { out, graph }
    }

    /// Graph of the instance being written
    #[must_use]
    pub fn graph(&self) -> &ValueGraph {
        self.graph
    }

    /// Write a class member
    pub fn write_value(&mut self, value: Option<ValueId>) -> Result<()> {
        self.out.write_value(self.graph, value)
    }

    /// Write an optional class member
    pub fn write_value_opt(&mut self, tag: i32, value: Option<ValueId>) -> Result<()> {
        self.out.write_value_opt(self.graph, tag, value)
    }

    /// End the current slice, writing its indirection table if needed
    pub fn end_slice(&mut self) -> Result<()> {
        let graph = self.graph;
        let out = &mut *self.out;
        with_encoder!(out, end_slice(Some(graph)))
    }
}

impl Deref for InstanceWriter<'_> {
    type Target = OutputStream;

    fn deref(&self) -> &OutputStream {
        &*self.out
    }
}

impl DerefMut for InstanceWriter<'_> {
    fn deref_mut(&mut self) -> &mut OutputStream {
        &mut *self.out
    }
}
