//! 1.1 decoder.
//!
//! An instance's slots are reserved before its slices are read, so cyclic
//! back-references resolve to the instance being decoded. References made
//! through an indirection table get a placeholder slot that is forwarded
//! once the table, which follows the slice body, has been read.

use std::collections::HashMap;

use tracing::trace;

use super::{DecoderState, InstanceDecoder, lookup_type_id, remember_type_id, state_mismatch};
use crate::encoder::{SliceKind, flags};
use crate::error::{CodecError, Result};
use crate::exception::{UnknownUserException, UserException};
use crate::input::InputStream;
use crate::optional::OptionalFormat;
use crate::value::{SliceInfo, SlicedData, UnknownSlicedValue, Value, ValueId};

/// Marshaled index of the first inline instance
const FIRST_INSTANCE_INDEX: usize = 2;

#[derive(Debug)]
struct ReadFrame {
    kind: SliceKind,
    skip_first_slice: bool,
    flags: u8,
    type_id: String,
    compact_id: Option<i32>,
    slice_size: usize,
    indirect_patches: Vec<(usize, ValueId)>,
    slices: Vec<SliceInfo>,
}

impl ReadFrame {
    fn new(kind: SliceKind) -> Self {
        Self {
            kind,
            skip_first_slice: false,
            flags: 0,
            type_id: String::new(),
            compact_id: None,
            slice_size: 0,
            indirect_patches: Vec::new(),
            slices: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct State11 {
    frames: Vec<ReadFrame>,
    type_ids: HashMap<usize, String>,
    instances: HashMap<usize, ValueId>,
    forward: HashMap<usize, ValueId>,
    read_count: usize,
}

impl State11 {
    pub(super) fn check_finished(&self) -> Result<()> {
        if !self.frames.is_empty() {
            return Err(CodecError::misuse("instance or exception not fully read"));
        }
        match self.forward.keys().min() {
            Some(index) => Err(CodecError::UnresolvedInstance(*index as i32)),
            None => Ok(()),
        }
    }
}

fn state11<'s>(input: &'s mut InputStream<'_>) -> Result<&'s mut State11> {
    match &mut input.current_mut().state {
        DecoderState::V11(state) => Ok(state),
        DecoderState::V10(_) => Err(state_mismatch()),
    }
}

fn frame<'s>(input: &'s mut InputStream<'_>) -> Result<&'s mut ReadFrame> {
    state11(input)?
        .frames
        .last_mut()
        .ok_or_else(|| CodecError::misuse("slice read outside an instance or exception"))
}

pub(crate) struct Decoder11;

impl Decoder11 {
    fn read_slice_header(input: &mut InputStream<'_>) -> Result<()> {
        let slice_flags = input.read_u8()?;
        let kind = frame(input)?.kind;
        let (type_id, compact_id) = match kind {
            SliceKind::Value => match slice_flags & flags::TYPE_ID_MASK {
                flags::TYPE_ID_COMPACT => {
                    let compact_id = i32::try_from(input.read_size()?)
                        .map_err(|_| CodecError::invalid("compact type id out of range"))?;
                    (String::new(), Some(compact_id))
                }
                flags::TYPE_ID_INDEX => {
                    let index = input.read_size()?;
                    (lookup_type_id(&state11(input)?.type_ids, index)?, None)
                }
                flags::TYPE_ID_STRING => {
                    let type_id = input.read_string()?;
                    remember_type_id(&mut state11(input)?.type_ids, &type_id);
                    (type_id, None)
                }
                // only the first slice carries a type ID in the compact format
                _ => (String::new(), None),
            },
            SliceKind::Exception => (input.read_string()?, None),
        };
        let slice_size = if slice_flags & flags::HAS_SLICE_SIZE != 0 {
            let size = input.read_i32()?;
            if size < 4 {
                return Err(CodecError::InvalidSize(i64::from(size)));
            }
            size as usize
        } else {
            0
        };

        let frame = frame(input)?;
        frame.flags = slice_flags;
        frame.type_id = type_id;
        frame.compact_id = compact_id;
        frame.slice_size = slice_size;
        Ok(())
    }

    /// Skip the current slice, keeping its bytes and indirection table
    fn skip_slice(input: &mut InputStream<'_>) -> Result<()> {
        let (slice_flags, size, type_id, compact_id) = {
            let frame = frame(input)?;
            (frame.flags, frame.slice_size, frame.type_id.clone(), frame.compact_id)
        };
        trace!(type_id = %type_id, "skipping 1.1 slice");
        if slice_flags & flags::HAS_SLICE_SIZE == 0 {
            return Err(CodecError::NoValueFactory(type_id));
        }
        let body = input.read_bytes(size - 4)?;
        let has_optional_members = slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0;
        let bytes = if has_optional_members {
            // the end marker is re-added when the slice is written again
            body[..body.len().saturating_sub(1)].to_vec()
        } else {
            body.to_vec()
        };
        let instances = if slice_flags & flags::HAS_INDIRECTION_TABLE != 0 {
            Self::read_indirection_table(input)?
        } else {
            Vec::new()
        };
        frame(input)?.slices.push(SliceInfo {
            type_id,
            compact_id,
            bytes,
            instances,
            has_optional_members,
            is_last: slice_flags & flags::IS_LAST_SLICE != 0,
        });
        Ok(())
    }

    fn read_indirection_table(input: &mut InputStream<'_>) -> Result<Vec<ValueId>> {
        let count = input.read_and_check_seq_size(1)?;
        if count == 0 {
            return Err(CodecError::invalid("empty indirection table"));
        }
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let index = input.read_size()?;
            if index == 0 {
                return Err(CodecError::invalid("null entry in indirection table"));
            }
            table.push(Self::read_instance(input, index)?);
        }
        Ok(table)
    }

    /// Resolve the frame's compact ID, if any, and return its type ID
    fn resolve_type_id(input: &mut InputStream<'_>) -> Result<String> {
        let registry = input.registry();
        let frame = frame(input)?;
        if let (Some(compact_id), true) = (frame.compact_id, frame.type_id.is_empty()) {
            if let Some(type_id) = registry.and_then(|registry| registry.compact_type_id(compact_id)) {
                frame.type_id = type_id.to_string();
            }
        }
        Ok(frame.type_id.clone())
    }

    /// Read an instance given its marshaled index.
    ///
    /// Index `1` announces a new inline instance; higher indices refer to an
    /// instance already read (or, for malformed input, not yet read).
    fn read_instance(input: &mut InputStream<'_>, index: usize) -> Result<ValueId> {
        if index > 1 {
            if let Some(slot) = state11(input)?.instances.get(&index) {
                return Ok(*slot);
            }
            let slot = input.graph.reserve();
            let state = state11(input)?;
            state.instances.insert(index, slot);
            state.forward.insert(index, slot);
            return Ok(slot);
        }

        let depth = state11(input)?
            .frames
            .iter()
            .filter(|frame| frame.kind == SliceKind::Value)
            .count();
        if depth >= input.max_class_depth() {
            return Err(CodecError::invalid("maximum class graph depth reached"));
        }

        let state = state11(input)?;
        let index = FIRST_INSTANCE_INDEX + state.read_count;
        state.read_count += 1;
        let reserved = state.forward.remove(&index);
        let slot = match reserved {
            Some(slot) => slot,
            None => input.graph.reserve(),
        };
        let state = state11(input)?;
        state.instances.insert(index, slot);
        state.frames.push(ReadFrame::new(SliceKind::Value));

        Self::read_slice_header(input)?;
        let most_derived = Self::resolve_type_id(input)?;
        let registry = input.registry();

        let mut value: Box<dyn Value> = loop {
            let type_id = Self::resolve_type_id(input)?;
            let (slice_flags, compact_id) = {
                let frame = frame(input)?;
                (frame.flags, frame.compact_id)
            };
            if !type_id.is_empty() {
                if let Some(value) = registry.and_then(|registry| registry.create_value(&type_id)) {
                    break value;
                }
            }
            if slice_flags & flags::HAS_SLICE_SIZE == 0 {
                return Err(match compact_id {
                    Some(compact_id) if type_id.is_empty() => CodecError::UnknownCompactId(compact_id),
                    _ => CodecError::NoValueFactory(type_id),
                });
            }
            Self::skip_slice(input)?;
            if slice_flags & flags::IS_LAST_SLICE != 0 {
                break Box::new(UnknownSlicedValue::new(most_derived.clone()));
            }
            Self::read_slice_header(input)?;
        };

        frame(input)?.skip_first_slice = true;
        value.read(input)?;

        let finished = state11(input)?
            .frames
            .pop()
            .ok_or_else(|| CodecError::misuse("instance frame missing"))?;
        if !finished.slices.is_empty() {
            value.set_sliced_data(SlicedData {
                slices: finished.slices,
            });
        }
        input.graph.fill(slot, value)?;
        Ok(slot)
    }

    fn unknown_exception(input: &mut InputStream<'_>, type_id: String) -> Result<Box<dyn UserException>> {
        state11(input)?.frames.pop();
        Ok(Box::new(UnknownUserException { type_id }))
    }
}

impl InstanceDecoder for Decoder11 {
    fn read_value(input: &mut InputStream<'_>) -> Result<Option<ValueId>> {
        let index = input.read_size()?;
        if index == 0 {
            return Ok(None);
        }
        let indirect = state11(input)?
            .frames
            .last()
            .is_some_and(|frame| frame.flags & flags::HAS_INDIRECTION_TABLE != 0);
        if indirect {
            let placeholder = input.graph.reserve();
            frame(input)?
                .indirect_patches
                .push((index - 1, placeholder));
            return Ok(Some(placeholder));
        }

        let slot = Self::read_instance(input, index)?;
        let state = state11(input)?;
        if state.frames.is_empty() {
            if let Some(index) = state.forward.keys().min() {
                return Err(CodecError::UnresolvedInstance(*index as i32));
            }
        }
        Ok(Some(slot))
    }

    fn read_pending_values(_input: &mut InputStream<'_>) -> Result<()> {
        Ok(())
    }

    fn read_exception(input: &mut InputStream<'_>) -> Result<Box<dyn UserException>> {
        state11(input)?
            .frames
            .push(ReadFrame::new(SliceKind::Exception));
        Self::read_slice_header(input)?;
        let most_derived = frame(input)?.type_id.clone();
        let registry = input.registry();

        loop {
            let (type_id, slice_flags) = {
                let frame = frame(input)?;
                (frame.type_id.clone(), frame.flags)
            };
            if let Some(mut exception) =
                registry.and_then(|registry| registry.create_exception(&type_id))
            {
                frame(input)?.skip_first_slice = true;
                exception.read(input)?;
                state11(input)?.frames.pop();
                return Ok(exception);
            }
            if slice_flags & flags::HAS_SLICE_SIZE == 0 {
                // without slice sizes the remainder of the encapsulation is opaque
                let end = input.position() + input.remaining();
                input.set_position(end);
                return Self::unknown_exception(input, most_derived);
            }
            Self::skip_slice(input)?;
            if slice_flags & flags::IS_LAST_SLICE != 0 {
                return Self::unknown_exception(input, most_derived);
            }
            Self::read_slice_header(input)?;
        }
    }

    fn start_slice(input: &mut InputStream<'_>) -> Result<()> {
        let frame = frame(input)?;
        if frame.skip_first_slice {
            frame.skip_first_slice = false;
            return Ok(());
        }
        Self::read_slice_header(input)
    }

    fn end_slice(input: &mut InputStream<'_>) -> Result<()> {
        let slice_flags = frame(input)?.flags;
        if slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0 {
            input.skip_optionals()?;
        }
        if slice_flags & flags::HAS_INDIRECTION_TABLE != 0 {
            let table = Self::read_indirection_table(input)?;
            let patches = std::mem::take(&mut frame(input)?.indirect_patches);
            if patches.is_empty() && slice_flags & flags::HAS_OPTIONAL_MEMBERS == 0 {
                return Err(CodecError::invalid("indirection table with no references"));
            }
            for (position, placeholder) in patches {
                let target = table
                    .get(position)
                    .ok_or_else(|| CodecError::invalid("indirection table index out of range"))?;
                input.graph.forward(placeholder, *target)?;
            }
        }
        Ok(())
    }

    fn read_optional(input: &mut InputStream<'_>, tag: i32, format: OptionalFormat) -> Result<bool> {
        let in_slice_without_optionals = state11(input)?
            .frames
            .last()
            .is_some_and(|frame| frame.flags & flags::HAS_OPTIONAL_MEMBERS == 0);
        if in_slice_without_optionals {
            return Ok(false);
        }
        input.read_optional_header(tag, format)
    }
}
