//! 1.0 decoder.

use std::collections::HashMap;

use tracing::trace;

use super::{DecoderState, InstanceDecoder, lookup_type_id, remember_type_id, state_mismatch};
use crate::encoder::SliceKind;
use crate::error::{CodecError, Result};
use crate::exception::{UnknownUserException, UserException};
use crate::input::InputStream;
use crate::optional::OptionalFormat;
use crate::value::{OBJECT_TYPE_ID, ValueId};

#[derive(Debug, Default)]
pub(crate) struct State10 {
    kind: Option<SliceKind>,
    skip_first_slice: bool,
    type_id: String,
    slice_size: usize,
    type_ids: HashMap<usize, String>,
    slots: HashMap<i32, ValueId>,
}

fn state10<'s>(input: &'s mut InputStream<'_>) -> Result<&'s mut State10> {
    match &mut input.current_mut().state {
        DecoderState::V10(state) => Ok(state),
        DecoderState::V11(_) => Err(state_mismatch()),
    }
}

pub(crate) struct Decoder10;

impl Decoder10 {
    fn read_slice_header(input: &mut InputStream<'_>) -> Result<()> {
        let kind = state10(input)?
            .kind
            .ok_or_else(|| CodecError::misuse("slice read outside an instance or exception"))?;
        let type_id = match kind {
            SliceKind::Value => {
                if input.read_bool()? {
                    let index = input.read_size()?;
                    lookup_type_id(&state10(input)?.type_ids, index)?
                } else {
                    let type_id = input.read_string()?;
                    remember_type_id(&mut state10(input)?.type_ids, &type_id);
                    type_id
                }
            }
            SliceKind::Exception => input.read_string()?,
        };
        let size = input.read_i32()?;
        if size < 4 {
            return Err(CodecError::InvalidSize(i64::from(size)));
        }
        let state = state10(input)?;
        state.type_id = type_id;
        state.slice_size = size as usize;
        Ok(())
    }

    fn skip_slice(input: &mut InputStream<'_>) -> Result<()> {
        let state = state10(input)?;
        trace!(type_id = %state.type_id, "skipping 1.0 slice");
        let size = state.slice_size - 4;
        input.skip(size)
    }

    /// Slot for an instance index, reserved on first mention
    fn slot_for(input: &mut InputStream<'_>, index: i32) -> Result<ValueId> {
        if let Some(slot) = state10(input)?.slots.get(&index) {
            return Ok(*slot);
        }
        let slot = input.graph.reserve();
        state10(input)?.slots.insert(index, slot);
        Ok(slot)
    }

    fn read_instance(input: &mut InputStream<'_>) -> Result<()> {
        let index = input.read_i32()?;
        if index <= 0 {
            return Err(CodecError::invalid(format!("invalid instance index {index}")));
        }
        {
            let state = state10(input)?;
            state.kind = Some(SliceKind::Value);
            state.skip_first_slice = false;
        }
        Self::read_slice_header(input)?;
        let most_derived = state10(input)?.type_id.clone();
        let registry = input.registry();

        let mut value = loop {
            let type_id = state10(input)?.type_id.clone();
            // the Object slice terminates every instance
            if type_id == OBJECT_TYPE_ID {
                return Err(CodecError::NoValueFactory(most_derived));
            }
            if let Some(value) = registry.and_then(|registry| registry.create_value(&type_id)) {
                break value;
            }
            Self::skip_slice(input)?;
            Self::read_slice_header(input)?;
        };

        let slot = Self::slot_for(input, index)?;
        if input.graph.is_resolved(slot) {
            return Err(CodecError::invalid(format!("instance {index} sent twice")));
        }
        state10(input)?.skip_first_slice = true;
        value.read(input)?;

        Self::start_slice(input)?;
        if input.read_size()? != 0 {
            return Err(CodecError::invalid("invalid ::Ice::Object slice"));
        }
        state10(input)?.kind = None;
        input.graph.fill(slot, value)
    }

    fn unknown_exception(input: &mut InputStream<'_>, type_id: String) -> Result<Box<dyn UserException>> {
        state10(input)?.kind = None;
        Ok(Box::new(UnknownUserException { type_id }))
    }
}

impl InstanceDecoder for Decoder10 {
    fn read_value(input: &mut InputStream<'_>) -> Result<Option<ValueId>> {
        let index = input.read_i32()?;
        if index > 0 {
            return Err(CodecError::invalid(format!("invalid instance reference {index}")));
        }
        if index == 0 {
            return Ok(None);
        }
        let index = index
            .checked_neg()
            .ok_or_else(|| CodecError::invalid("instance reference out of range"))?;
        Self::slot_for(input, index).map(Some)
    }

    fn read_pending_values(input: &mut InputStream<'_>) -> Result<()> {
        loop {
            let count = input.read_size()?;
            if count == 0 {
                break;
            }
            for _ in 0..count {
                Self::read_instance(input)?;
            }
        }
        let mut slots: Vec<(i32, ValueId)> = state10(input)?
            .slots
            .iter()
            .map(|(index, slot)| (*index, *slot))
            .collect();
        slots.sort_unstable();
        for (index, slot) in slots {
            if !input.graph.is_resolved(slot) {
                return Err(CodecError::UnresolvedInstance(index));
            }
        }
        Ok(())
    }

    fn read_exception(input: &mut InputStream<'_>) -> Result<Box<dyn UserException>> {
        let uses_classes = input.read_bool()?;
        {
            let state = state10(input)?;
            state.kind = Some(SliceKind::Exception);
            state.skip_first_slice = false;
        }
        Self::read_slice_header(input)?;
        let most_derived = state10(input)?.type_id.clone();
        let registry = input.registry();

        loop {
            let type_id = state10(input)?.type_id.clone();
            if let Some(mut exception) =
                registry.and_then(|registry| registry.create_exception(&type_id))
            {
                state10(input)?.skip_first_slice = true;
                exception.read(input)?;
                state10(input)?.kind = None;
                if uses_classes {
                    Self::read_pending_values(input)?;
                }
                return Ok(exception);
            }
            Self::skip_slice(input)?;
            // 1.0 has no last-slice marker: running out of data ends the hierarchy
            if input.is_empty() {
                return Self::unknown_exception(input, most_derived);
            }
            match Self::read_slice_header(input) {
                Ok(()) => {}
                Err(CodecError::UnexpectedEnd { .. }) => {
                    return Self::unknown_exception(input, most_derived);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn start_slice(input: &mut InputStream<'_>) -> Result<()> {
        let state = state10(input)?;
        if state.skip_first_slice {
            state.skip_first_slice = false;
            return Ok(());
        }
        Self::read_slice_header(input)
    }

    fn end_slice(_input: &mut InputStream<'_>) -> Result<()> {
        Ok(())
    }

    fn read_optional(_input: &mut InputStream<'_>, _tag: i32, _format: OptionalFormat) -> Result<bool> {
        Ok(false)
    }
}
