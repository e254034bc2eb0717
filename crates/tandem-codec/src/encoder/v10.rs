//! 1.0 encoder.
//!
//! Class references are negative `i32` indices; the instances themselves are
//! queued and written in batches by `write_pending_values`. Every instance
//! ends with an empty `::Ice::Object` slice and every slice carries an `i32`
//! size. Optionals do not exist.

use std::collections::HashMap;

use super::{EncoderState, InstanceEncoder, SliceKind, register_type_id, state_mismatch};
use crate::error::{CodecError, Result};
use crate::exception::UserException;
use crate::optional::OptionalFormat;
use crate::output::{InstanceWriter, OutputStream, Placeholder};
use crate::value::{OBJECT_TYPE_ID, ValueGraph, ValueId};

#[derive(Debug, Default)]
pub(crate) struct State10 {
    indices: HashMap<ValueId, i32>,
    to_marshal: Vec<ValueId>,
    type_ids: HashMap<String, usize>,
    kind: Option<SliceKind>,
    slice_size: Option<Placeholder>,
    exception_classes: bool,
}

impl State10 {
    pub(super) fn check_finished(&self) -> Result<()> {
        if !self.to_marshal.is_empty() {
            return Err(CodecError::misuse(format!(
                "{} class instance(s) referenced but never written",
                self.to_marshal.len()
            )));
        }
        if self.kind.is_some() {
            return Err(CodecError::misuse("instance or exception not ended"));
        }
        Ok(())
    }
}

fn state10(out: &mut OutputStream) -> Result<&mut State10> {
    match &mut out.current_mut().state {
        EncoderState::V10(state) => Ok(state),
        EncoderState::V11(_) => Err(state_mismatch()),
    }
}

pub(crate) struct Encoder10;

impl Encoder10 {
    fn write_instance(out: &mut OutputStream, graph: &ValueGraph, id: ValueId) -> Result<()> {
        let value = graph
            .get(id)
            .ok_or_else(|| CodecError::misuse("class reference to an empty slot"))?;
        state10(out)?.kind = Some(SliceKind::Value);
        value.write(&mut InstanceWriter::new(out, graph))?;

        Self::start_slice(out, OBJECT_TYPE_ID, None, true)?;
        out.write_size(0);
        Self::end_slice(out, Some(graph))?;
        state10(out)?.kind = None;
        Ok(())
    }
}

impl InstanceEncoder for Encoder10 {
    fn write_value(out: &mut OutputStream, graph: &ValueGraph, value: Option<ValueId>) -> Result<()> {
        let state = state10(out)?;
        if state.kind == Some(SliceKind::Exception) {
            state.exception_classes = true;
        }
        let Some(id) = value else {
            out.write_i32(0);
            return Ok(());
        };
        if graph.get(id).is_none() {
            return Err(CodecError::misuse("class reference to an empty slot"));
        }
        let id = graph.resolve(id);
        let state = state10(out)?;
        let index = match state.indices.get(&id) {
            Some(index) => *index,
            None => {
                let index = state.indices.len() as i32 + 1;
                state.indices.insert(id, index);
                state.to_marshal.push(id);
                index
            }
        };
        out.write_i32(-index);
        Ok(())
    }

    fn write_pending_values(out: &mut OutputStream, graph: &ValueGraph) -> Result<()> {
        loop {
            let state = state10(out)?;
            let batch = std::mem::take(&mut state.to_marshal);
            let indices: Vec<i32> = batch.iter().map(|id| state.indices[id]).collect();
            out.write_size(batch.len());
            if batch.is_empty() {
                return Ok(());
            }
            for (id, index) in batch.into_iter().zip(indices) {
                out.write_i32(index);
                Self::write_instance(out, graph, id)?;
            }
        }
    }

    fn write_exception(out: &mut OutputStream, exception: &dyn UserException) -> Result<()> {
        // "uses classes" flag, set once a class member was written
        let flag_pos = out.len();
        out.write_bool(false);
        let state = state10(out)?;
        state.kind = Some(SliceKind::Exception);
        state.exception_classes = false;
        exception.write(out)?;

        let state = state10(out)?;
        state.kind = None;
        if !std::mem::take(&mut state.exception_classes) {
            return Ok(());
        }
        out.rewrite(flag_pos, &[1]);
        let empty = ValueGraph::new();
        Self::write_pending_values(out, exception.values().unwrap_or(&empty))
    }

    fn start_slice(out: &mut OutputStream, type_id: &str, _compact_id: Option<i32>, _last: bool) -> Result<()> {
        let state = state10(out)?;
        let kind = state
            .kind
            .ok_or_else(|| CodecError::misuse("slice started outside an instance or exception"))?;
        if state.slice_size.is_some() {
            return Err(CodecError::misuse("previous slice not ended"));
        }
        match kind {
            SliceKind::Value => match register_type_id(&mut state.type_ids, type_id) {
                Some(index) => {
                    out.write_bool(true);
                    out.write_size(index);
                }
                None => {
                    out.write_bool(false);
                    out.write_string(type_id);
                }
            },
            SliceKind::Exception => out.write_string(type_id),
        }
        let size = out.reserve_placeholder();
        state10(out)?.slice_size = Some(size);
        Ok(())
    }

    fn end_slice(out: &mut OutputStream, _graph: Option<&ValueGraph>) -> Result<()> {
        let size = state10(out)?
            .slice_size
            .take()
            .ok_or_else(|| CodecError::misuse("no slice to end"))?;
        out.finish_placeholder(size, true)
    }

    fn write_optional(_out: &mut OutputStream, _tag: i32, _format: OptionalFormat) -> Result<bool> {
        Ok(false)
    }
}
