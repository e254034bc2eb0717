//! 1.1 encoder.
//!
//! Instances are written inline the first time they are referenced and as a
//! back-reference afterwards. In the sliced format, references made from
//! inside a slice go through the slice's indirection table, which follows the
//! slice body. Each slice starts with a flags byte that is only known once the
//! slice ends, so it is written as a placeholder and patched.

use std::collections::HashMap;

use super::{EncoderState, InstanceEncoder, SliceKind, flags, register_type_id, state_mismatch};
use crate::error::{CodecError, Result};
use crate::exception::UserException;
use crate::optional::{self, OPTIONAL_END_MARKER, OptionalFormat};
use crate::output::{InstanceWriter, OutputStream, Placeholder};
use crate::value::{SlicedData, ValueGraph, ValueId};
use crate::version::FormatType;

/// Marshaled index of the first instance; `0` is null and `1` marks an inline instance
const FIRST_INSTANCE_INDEX: usize = 2;

#[derive(Debug)]
struct OpenSlice {
    flags_pos: usize,
    flags: u8,
    size: Option<Placeholder>,
}

#[derive(Debug)]
struct InstanceFrame {
    kind: SliceKind,
    first_slice: bool,
    slice: Option<OpenSlice>,
    indirection_table: Vec<ValueId>,
    indirection_map: HashMap<ValueId, usize>,
}

impl InstanceFrame {
    fn new(kind: SliceKind) -> Self {
        Self {
            kind,
            first_slice: true,
            slice: None,
            indirection_table: Vec::new(),
            indirection_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct State11 {
    marshaled: HashMap<ValueId, usize>,
    type_ids: HashMap<String, usize>,
    frames: Vec<InstanceFrame>,
}

impl State11 {
    pub(super) fn check_finished(&self) -> Result<()> {
        if self.frames.is_empty() {
            Ok(())
        } else {
            Err(CodecError::misuse("instance or exception not ended"))
        }
    }

    fn frame(&mut self) -> Result<&mut InstanceFrame> {
        self.frames
            .last_mut()
            .ok_or_else(|| CodecError::misuse("slice used outside an instance or exception"))
    }
}

fn state11(out: &mut OutputStream) -> Result<&mut State11> {
    match &mut out.current_mut().state {
        EncoderState::V11(state) => Ok(state),
        EncoderState::V10(_) => Err(state_mismatch()),
    }
}

pub(crate) struct Encoder11;

impl Encoder11 {
    /// Write an instance inline, or a back-reference if already written
    fn write_instance(out: &mut OutputStream, graph: &ValueGraph, id: ValueId) -> Result<()> {
        let id = graph.resolve(id);
        let value = graph
            .get(id)
            .ok_or_else(|| CodecError::misuse("class reference to an empty slot"))?;

        let state = state11(out)?;
        if let Some(index) = state.marshaled.get(&id) {
            let index = *index;
            out.write_size(index);
            return Ok(());
        }
        let index = state.marshaled.len() + FIRST_INSTANCE_INDEX;
        state.marshaled.insert(id, index);
        out.write_size(1);

        state11(out)?.frames.push(InstanceFrame::new(SliceKind::Value));
        if let Some(sliced) = value.sliced_data() {
            Self::write_sliced_data(out, graph, sliced)?;
        }
        value.write(&mut InstanceWriter::new(out, graph))?;
        state11(out)?.frames.pop();
        Ok(())
    }

    /// Re-emit slices preserved when the instance was decoded
    fn write_sliced_data(out: &mut OutputStream, graph: &ValueGraph, sliced: &SlicedData) -> Result<()> {
        // the compact format drops unknown slices
        if out.format() != FormatType::Sliced {
            return Ok(());
        }
        for slice in &sliced.slices {
            Self::start_slice(out, &slice.type_id, slice.compact_id, slice.is_last)?;
            out.write_raw(&slice.bytes);
            let frame = state11(out)?.frame()?;
            if slice.has_optional_members {
                if let Some(open) = frame.slice.as_mut() {
                    open.flags |= flags::HAS_OPTIONAL_MEMBERS;
                }
            }
            for instance in &slice.instances {
                let id = graph.resolve(*instance);
                if !frame.indirection_map.contains_key(&id) {
                    frame.indirection_table.push(id);
                    frame
                        .indirection_map
                        .insert(id, frame.indirection_table.len());
                }
            }
            Self::end_slice(out, Some(graph))?;
        }
        Ok(())
    }
}

impl InstanceEncoder for Encoder11 {
    fn write_value(out: &mut OutputStream, graph: &ValueGraph, value: Option<ValueId>) -> Result<()> {
        let Some(id) = value else {
            out.write_size(0);
            return Ok(());
        };
        if graph.get(id).is_none() {
            return Err(CodecError::misuse("class reference to an empty slot"));
        }
        if out.format() != FormatType::Sliced || state11(out)?.frames.is_empty() {
            return Self::write_instance(out, graph, id);
        }
        let id = graph.resolve(id);
        let frame = state11(out)?.frame()?;
        let position = match frame.indirection_map.get(&id) {
            Some(position) => *position,
            None => {
                frame.indirection_table.push(id);
                let position = frame.indirection_table.len();
                frame.indirection_map.insert(id, position);
                position
            }
        };
        out.write_size(position);
        Ok(())
    }

    fn write_pending_values(_out: &mut OutputStream, _graph: &ValueGraph) -> Result<()> {
        Ok(())
    }

    fn write_exception(out: &mut OutputStream, exception: &dyn UserException) -> Result<()> {
        state11(out)?
            .frames
            .push(InstanceFrame::new(SliceKind::Exception));
        exception.write(out)?;
        state11(out)?.frames.pop();
        Ok(())
    }

    fn start_slice(out: &mut OutputStream, type_id: &str, compact_id: Option<i32>, last: bool) -> Result<()> {
        let sliced = out.format() == FormatType::Sliced;
        let flags_pos = out.len();
        let state = state11(out)?;
        let frame = state
            .frames
            .last_mut()
            .ok_or_else(|| CodecError::misuse("slice started outside an instance or exception"))?;
        if frame.slice.is_some() {
            return Err(CodecError::misuse("previous slice not ended"));
        }
        let kind = frame.kind;
        let write_type_id = sliced || frame.first_slice;
        frame.first_slice = false;

        let mut slice_flags = 0;
        if sliced {
            slice_flags |= flags::HAS_SLICE_SIZE;
        }
        if last {
            slice_flags |= flags::IS_LAST_SLICE;
        }

        // the type ID form is decided before anything is written
        enum TypeIdForm {
            Compact(i32),
            Index(usize),
            String,
            Omitted,
        }
        let form = match kind {
            SliceKind::Exception => TypeIdForm::String,
            SliceKind::Value if !write_type_id => TypeIdForm::Omitted,
            SliceKind::Value => match compact_id {
                Some(compact_id) => TypeIdForm::Compact(compact_id),
                None => match register_type_id(&mut state.type_ids, type_id) {
                    Some(index) => TypeIdForm::Index(index),
                    None => TypeIdForm::String,
                },
            },
        };

        out.write_u8(0);
        match form {
            TypeIdForm::Compact(compact_id) => {
                slice_flags |= flags::TYPE_ID_COMPACT;
                out.write_size(compact_id.max(0) as usize);
            }
            TypeIdForm::Index(index) => {
                slice_flags |= flags::TYPE_ID_INDEX;
                out.write_size(index);
            }
            TypeIdForm::String => {
                if kind == SliceKind::Value {
                    slice_flags |= flags::TYPE_ID_STRING;
                }
                out.write_string(type_id);
            }
            TypeIdForm::Omitted => {}
        }
        let size = sliced.then(|| out.reserve_placeholder());

        state11(out)?.frame()?.slice = Some(OpenSlice {
            flags_pos,
            flags: slice_flags,
            size,
        });
        Ok(())
    }

    fn end_slice(out: &mut OutputStream, graph: Option<&ValueGraph>) -> Result<()> {
        let frame = state11(out)?.frame()?;
        let mut open = frame
            .slice
            .take()
            .ok_or_else(|| CodecError::misuse("no slice to end"))?;
        let table = std::mem::take(&mut frame.indirection_table);
        frame.indirection_map.clear();

        if open.flags & flags::HAS_OPTIONAL_MEMBERS != 0 {
            out.write_u8(OPTIONAL_END_MARKER);
        }
        if let Some(size) = open.size {
            out.finish_placeholder(size, true)?;
        }
        if !table.is_empty() {
            let graph = graph.ok_or_else(|| {
                CodecError::misuse("indirection table written without an instance graph")
            })?;
            open.flags |= flags::HAS_INDIRECTION_TABLE;
            out.write_size(table.len());
            for id in table {
                Self::write_instance(out, graph, id)?;
            }
        }
        out.rewrite(open.flags_pos, &[open.flags]);
        Ok(())
    }

    fn write_optional(out: &mut OutputStream, tag: i32, format: OptionalFormat) -> Result<bool> {
        out.write_u8(optional::header_byte(tag, format));
        if tag > optional::MAX_INLINE_TAG {
            out.write_size(tag as usize);
        }
        if let Some(frame) = state11(out)?.frames.last_mut() {
            if let Some(open) = frame.slice.as_mut() {
                open.flags |= flags::HAS_OPTIONAL_MEMBERS;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use crate::input::InputStream;
    use crate::output::{InstanceWriter, OutputStream};
    use crate::value::{Value, ValueGraph};
    use crate::version::{EncodingVersion, FormatType};
    use crate::Result;

    #[derive(Debug, Default)]
    struct Node {
        next: Option<crate::ValueId>,
    }

    impl Value for Node {
        fn type_name(&self) -> &str {
            "::Test::Node"
        }

        fn write(&self, w: &mut InstanceWriter<'_>) -> Result<()> {
            w.start_slice("::Test::Node", None, true)?;
            w.write_value(self.next)?;
            w.end_slice()
        }

        fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            input.start_slice()?;
            self.next = input.read_value()?;
            input.end_slice()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_compact_inline_then_back_reference() {
        let mut graph = ValueGraph::new();
        let node = graph.add(Node::default());
        let mut out = OutputStream::with_format(EncodingVersion::V1_1, FormatType::Compact);
        out.write_value(&graph, Some(node)).unwrap();
        out.write_value(&graph, Some(node)).unwrap();
        out.write_value(&graph, None).unwrap();
        let expected: &[u8] = &[
            1, // inline instance
            32 | 1, // last slice, type id as string
            12,
            b':', b':', b'T', b'e', b's', b't', b':', b':', b'N', b'o', b'd', b'e',
            0,    // null member
            2,    // back-reference
            0,    // null
        ];
        assert_eq!(out.as_slice(), expected);
    }

    #[test]
    fn test_sliced_format_uses_indirection_table() {
        let mut graph = ValueGraph::new();
        let tail = graph.add(Node::default());
        let head = graph.add(Node { next: Some(tail) });
        let mut out = OutputStream::with_format(EncodingVersion::V1_1, FormatType::Sliced);
        out.write_value(&graph, Some(head)).unwrap();
        let bytes = out.as_slice();
        assert_eq!(bytes[0], 1);
        // last slice, sliced size, string type id, indirection table
        assert_eq!(bytes[1], 32 | 16 | 8 | 1);
        // slice body after type id and size: reference into table position 1
        let body = 2 + 13 + 4;
        assert_eq!(bytes[body], 1);
        // table of one entry follows: inline tail instance, with type id now indexed
        assert_eq!(&bytes[body + 1..body + 4], &[1, 1, 32 | 16 | 2]);
    }
}
