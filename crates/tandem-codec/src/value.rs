//! Class instances and the arena that holds an instance graph.
//!
//! Class instances reference each other by [`ValueId`], an index into a
//! [`ValueGraph`]. Cyclic graphs are therefore plain data: no reference
//! counting, no interior mutability. While decoding, references to instances
//! that have not been read yet (1.0 pending instances, 1.1 indirection
//! tables) get a slot immediately; the slot is filled or forwarded once the
//! instance is known.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::error::{CodecError, Result};
use crate::exception::UserException;
use crate::input::InputStream;
use crate::output::InstanceWriter;

/// Type ID of the root of every class hierarchy
pub const OBJECT_TYPE_ID: &str = "::Ice::Object";

/// Handle to an instance stored in a [`ValueGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(usize);

impl ValueId {
    /// Raw arena index
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A marshalable class instance.
///
/// `write` and `read` encode the instance's slices from most derived to
/// least derived, each framed by `start_slice` / `end_slice`:
///
/// ```ignore
/// fn write(&self, w: &mut InstanceWriter<'_>) -> Result<()> {
///     w.start_slice("::Demo::Node", None, true)?;
///     w.write_i32(self.weight);
///     w.write_value(self.next)?;
///     w.end_slice()
/// }
/// ```
pub trait Value: Any + Send + fmt::Debug {
    /// Most-derived type ID of this instance
    fn type_name(&self) -> &str;

    /// Encode all slices of this instance
    fn write(&self, w: &mut InstanceWriter<'_>) -> Result<()>;

    /// Decode all known slices of this instance
    fn read(&mut self, input: &mut InputStream<'_>) -> Result<()>;

    /// Unknown slices preserved when this instance was decoded
    fn sliced_data(&self) -> Option<&SlicedData> {
        None
    }

    /// Attach slices that were skipped while decoding this instance
    fn set_sliced_data(&mut self, _data: SlicedData) {}

    /// Upcast for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One skipped slice, kept byte-for-byte so it can be re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceInfo {
    /// Type ID of the slice
    pub type_id: String,
    /// Compact type ID, if the slice was encoded with one
    pub compact_id: Option<i32>,
    /// Slice body, without the optional end marker
    pub bytes: Vec<u8>,
    /// Instances of the slice's indirection table, in table order
    pub instances: Vec<ValueId>,
    /// The slice had optional members
    pub has_optional_members: bool,
    /// The slice was the last (least derived) one
    pub is_last: bool,
}

/// Slices of an instance that the receiver did not know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlicedData {
    /// Skipped slices, most derived first
    pub slices: Vec<SliceInfo>,
}

impl SlicedData {
    /// Check whether any slice was preserved
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

/// Stand-in for an instance none of whose slices had a registered factory.
///
/// It keeps every slice, so forwarding it re-encodes the original bytes.
#[derive(Debug, Clone, Default)]
pub struct UnknownSlicedValue {
    type_id: String,
    sliced: SlicedData,
}

impl UnknownSlicedValue {
    /// Create for the given most-derived type ID
    #[must_use]
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            sliced: SlicedData::default(),
        }
    }
}

impl Value for UnknownSlicedValue {
    fn type_name(&self) -> &str {
        &self.type_id
    }

    fn write(&self, _w: &mut InstanceWriter<'_>) -> Result<()> {
        // every slice is emitted from the preserved sliced data
        Ok(())
    }

    fn read(&mut self, _input: &mut InputStream<'_>) -> Result<()> {
        Ok(())
    }

    fn sliced_data(&self) -> Option<&SlicedData> {
        Some(&self.sliced)
    }

    fn set_sliced_data(&mut self, data: SlicedData) {
        self.sliced = data;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

enum Slot {
    Pending,
    Value(Box<dyn Value>),
    Forward(ValueId),
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Value(value) => write!(f, "Value({})", value.type_name()),
            Self::Forward(target) => write!(f, "Forward({})", target.0),
        }
    }
}

/// Arena of class instances.
#[derive(Debug, Default)]
pub struct ValueGraph {
    slots: Vec<Slot>,
}

impl ValueGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a boxed instance
    pub fn insert(&mut self, value: Box<dyn Value>) -> ValueId {
        self.slots.push(Slot::Value(value));
        ValueId(self.slots.len() - 1)
    }

    /// Add an instance
    pub fn add<T: Value>(&mut self, value: T) -> ValueId {
        self.insert(Box::new(value))
    }

    /// Number of slots, including forwarding slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check whether the graph holds no slots
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Follow forwarding slots to the slot that holds (or will hold) the instance
    #[must_use]
    pub fn resolve(&self, id: ValueId) -> ValueId {
        let mut current = id;
        // a forwarding chain never revisits a slot, so it is bounded by the arena size
        for _ in 0..=self.slots.len() {
            match self.slots.get(current.0) {
                Some(Slot::Forward(next)) => current = *next,
                _ => return current,
            }
        }
        current
    }

    /// Get an instance
    #[must_use]
    pub fn get(&self, id: ValueId) -> Option<&dyn Value> {
        match self.slots.get(self.resolve(id).0) {
            Some(Slot::Value(value)) => Some(value.as_ref()),
            _ => None,
        }
    }

    /// Get a mutable instance
    pub fn get_mut(&mut self, id: ValueId) -> Option<&mut dyn Value> {
        let id = self.resolve(id);
        match self.slots.get_mut(id.0) {
            Some(Slot::Value(value)) => Some(value.as_mut()),
            _ => None,
        }
    }

    /// Get an instance of a concrete type
    #[must_use]
    pub fn get_as<T: Value>(&self, id: ValueId) -> Option<&T> {
        self.get(id)?.as_any().downcast_ref::<T>()
    }

    /// Get a mutable instance of a concrete type
    pub fn get_as_mut<T: Value>(&mut self, id: ValueId) -> Option<&mut T> {
        self.get_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Check whether two handles designate the same instance
    #[must_use]
    pub fn same(&self, a: ValueId, b: ValueId) -> bool {
        self.resolve(a) == self.resolve(b)
    }

    pub(crate) fn reserve(&mut self) -> ValueId {
        self.slots.push(Slot::Pending);
        ValueId(self.slots.len() - 1)
    }

    pub(crate) fn fill(&mut self, id: ValueId, value: Box<dyn Value>) -> Result<()> {
        match self.slots.get_mut(id.0) {
            Some(slot @ Slot::Pending) => {
                *slot = Slot::Value(value);
                Ok(())
            }
            _ => Err(CodecError::invalid("instance slot already filled")),
        }
    }

    pub(crate) fn forward(&mut self, id: ValueId, target: ValueId) -> Result<()> {
        if self.resolve(target) == id {
            return Err(CodecError::invalid("instance forwards to itself"));
        }
        match self.slots.get_mut(id.0) {
            Some(slot @ Slot::Pending) => {
                *slot = Slot::Forward(target);
                Ok(())
            }
            _ => Err(CodecError::invalid("instance slot already filled")),
        }
    }

    pub(crate) fn is_resolved(&self, id: ValueId) -> bool {
        matches!(self.slots.get(self.resolve(id).0), Some(Slot::Value(_)))
    }
}

/// Constructor for a class or exception type
pub type ValueFactory = fn() -> Box<dyn Value>;

/// Constructor for a user exception type
pub type ExceptionFactory = fn() -> Box<dyn UserException>;

fn construct_value<T: Value + Default>() -> Box<dyn Value> {
    Box::new(T::default())
}

fn construct_exception<T: UserException + Default>() -> Box<dyn UserException> {
    Box::new(T::default())
}

/// Type ID to constructor mappings used while decoding.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    values: HashMap<String, ValueFactory>,
    exceptions: HashMap<String, ExceptionFactory>,
    compact_ids: HashMap<i32, String>,
}

impl TypeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class type
    pub fn register_value<T: Value + Default>(&mut self, type_id: &str) -> &mut Self {
        self.values
            .insert(type_id.to_string(), construct_value::<T> as ValueFactory);
        self
    }

    /// Register a class type together with its compact ID
    pub fn register_value_compact<T: Value + Default>(
        &mut self,
        type_id: &str,
        compact_id: i32,
    ) -> &mut Self {
        self.compact_ids.insert(compact_id, type_id.to_string());
        self.register_value::<T>(type_id)
    }

    /// Register a user exception type
    pub fn register_exception<T: UserException + Default>(&mut self, type_id: &str) -> &mut Self {
        self.exceptions
            .insert(type_id.to_string(), construct_exception::<T> as ExceptionFactory);
        self
    }

    /// Construct a class instance
    #[must_use]
    pub fn create_value(&self, type_id: &str) -> Option<Box<dyn Value>> {
        self.values.get(type_id).map(|factory| factory())
    }

    /// Construct a user exception
    #[must_use]
    pub fn create_exception(&self, type_id: &str) -> Option<Box<dyn UserException>> {
        self.exceptions.get(type_id).map(|factory| factory())
    }

    /// Map a compact ID to its type ID
    #[must_use]
    pub fn compact_type_id(&self, compact_id: i32) -> Option<&str> {
        self.compact_ids.get(&compact_id).map(String::as_str)
    }
}
