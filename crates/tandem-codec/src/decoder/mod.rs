//! Class and exception decoders, the reading counterparts of
//! [`crate::encoder`].

mod v10;
mod v11;

pub(crate) use v10::{Decoder10, State10};
pub(crate) use v11::{Decoder11, State11};

use std::collections::HashMap;

use crate::error::{CodecError, Result};
use crate::exception::UserException;
use crate::input::InputStream;
use crate::optional::OptionalFormat;
use crate::value::ValueId;
use crate::version::EncodingVersion;

/// Per-encapsulation decoder state
#[derive(Debug)]
pub(crate) enum DecoderState {
    V10(State10),
    V11(State11),
}

impl DecoderState {
    pub(crate) fn new(encoding: EncodingVersion) -> Self {
        if encoding == EncodingVersion::V1_0 {
            Self::V10(State10::default())
        } else {
            Self::V11(State11::default())
        }
    }

    pub(crate) fn check_finished(&self) -> Result<()> {
        match self {
            Self::V10(_) => Ok(()),
            Self::V11(state) => state.check_finished(),
        }
    }
}

/// Decoding of class instances, exceptions and optionals
pub(crate) trait InstanceDecoder {
    fn read_value(input: &mut InputStream<'_>) -> Result<Option<ValueId>>;

    fn read_pending_values(input: &mut InputStream<'_>) -> Result<()>;

    fn read_exception(input: &mut InputStream<'_>) -> Result<Box<dyn UserException>>;

    fn start_slice(input: &mut InputStream<'_>) -> Result<()>;

    fn end_slice(input: &mut InputStream<'_>) -> Result<()>;

    fn read_optional(input: &mut InputStream<'_>, tag: i32, format: OptionalFormat) -> Result<bool>;
}

/// Record a type ID read as a string; later slices may refer to it by index
pub(crate) fn remember_type_id(table: &mut HashMap<usize, String>, type_id: &str) {
    let index = table.len() + 1;
    table.insert(index, type_id.to_string());
}

/// Look up a type ID sent as an index
pub(crate) fn lookup_type_id(table: &HashMap<usize, String>, index: usize) -> Result<String> {
    table
        .get(&index)
        .cloned()
        .ok_or_else(|| CodecError::invalid(format!("unknown type id index {index}")))
}

pub(crate) fn state_mismatch() -> CodecError {
    CodecError::misuse("decoder state does not match the encapsulation encoding")
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use crate::exception::{UnknownUserException, UserException};
    use crate::input::InputStream;
    use crate::output::{InstanceWriter, OutputStream};
    use crate::value::{SlicedData, TypeRegistry, UnknownSlicedValue, Value, ValueGraph, ValueId};
    use crate::version::{EncodingVersion, FormatType};
    use crate::{CodecError, Result};

    /// Base class with a reference member and an optional member
    #[derive(Debug, Default)]
    struct Node {
        label: String,
        next: Option<ValueId>,
        weight: Option<i32>,
    }

    impl Node {
        fn write_slice(&self, w: &mut InstanceWriter<'_>, last: bool) -> Result<()> {
            w.start_slice("::Test::Node", None, last)?;
            w.write_string(&self.label);
            w.write_value(self.next)?;
            w.write_i32_opt(1, self.weight)?;
            w.end_slice()
        }

        fn read_slice(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            input.start_slice()?;
            self.label = input.read_string()?;
            self.next = input.read_value()?;
            self.weight = input.read_i32_opt(1)?;
            input.end_slice()
        }
    }

    impl Value for Node {
        fn type_name(&self) -> &str {
            "::Test::Node"
        }

        fn write(&self, w: &mut InstanceWriter<'_>) -> Result<()> {
            self.write_slice(w, true)
        }

        fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            self.read_slice(input)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Derived class the receiver may not know
    #[derive(Debug, Default)]
    struct TaggedNode {
        base: Node,
        tag: String,
        sliced: SlicedData,
    }

    impl Value for TaggedNode {
        fn type_name(&self) -> &str {
            "::Test::TaggedNode"
        }

        fn write(&self, w: &mut InstanceWriter<'_>) -> Result<()> {
            w.start_slice("::Test::TaggedNode", None, false)?;
            w.write_string(&self.tag);
            w.end_slice()?;
            self.base.write_slice(w, true)
        }

        fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            input.start_slice()?;
            self.tag = input.read_string()?;
            input.end_slice()?;
            self.base.read_slice(input)
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

    /// Node that keeps unknown slices so it can forward them
    #[derive(Debug, Default)]
    struct PreservingNode {
        inner: Node,
        sliced: SlicedData,
    }

    impl Value for PreservingNode {
        fn type_name(&self) -> &str {
            "::Test::Node"
        }

        fn write(&self, w: &mut InstanceWriter<'_>) -> Result<()> {
            self.inner.write_slice(w, true)
        }

        fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            self.inner.read_slice(input)
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

    #[derive(Debug, Default)]
    struct BaseError {
        reason: String,
    }

    impl UserException for BaseError {
        fn type_name(&self) -> &str {
            "::Test::BaseError"
        }

        fn write(&self, out: &mut OutputStream) -> Result<()> {
            out.start_slice("::Test::BaseError", None, true)?;
            out.write_string(&self.reason);
            out.end_slice()
        }

        fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            input.start_slice()?;
            self.reason = input.read_string()?;
            input.end_slice()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Default)]
    struct DerivedError {
        code: i32,
        base: BaseError,
    }

    impl UserException for DerivedError {
        fn type_name(&self) -> &str {
            "::Test::DerivedError"
        }

        fn write(&self, out: &mut OutputStream) -> Result<()> {
            out.start_slice("::Test::DerivedError", None, false)?;
            out.write_i32(self.code);
            out.end_slice()?;
            self.base.write(out)
        }

        fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            input.start_slice()?;
            self.code = input.read_i32()?;
            input.end_slice()?;
            self.base.read(input)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Exception with a class member
    #[derive(Debug, Default)]
    struct NodeError {
        node: Option<ValueId>,
        values: ValueGraph,
    }

    impl UserException for NodeError {
        fn type_name(&self) -> &str {
            "::Test::NodeError"
        }

        fn write(&self, out: &mut OutputStream) -> Result<()> {
            out.start_slice("::Test::NodeError", None, true)?;
            out.write_value(&self.values, self.node)?;
            out.end_slice()
        }

        fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
            input.start_slice()?;
            self.node = input.read_value()?;
            input.end_slice()
        }

        fn values(&self) -> Option<&ValueGraph> {
            Some(&self.values)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn node_registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register_value::<Node>("::Test::Node");
        registry
    }

    fn cycle(graph: &mut ValueGraph) -> ValueId {
        let a = graph.add(Node {
            label: "a".into(),
            next: None,
            weight: Some(3),
        });
        let b = graph.add(Node {
            label: "b".into(),
            next: Some(a),
            weight: None,
        });
        graph.get_as_mut::<Node>(a).unwrap().next = Some(b);
        a
    }

    fn encode_graph(encoding: EncodingVersion, format: FormatType, graph: &ValueGraph, root: ValueId) -> Vec<u8> {
        let mut out = OutputStream::default();
        out.start_encapsulation(encoding, format).unwrap();
        out.write_value(graph, Some(root)).unwrap();
        out.write_pending_values(graph).unwrap();
        out.end_encapsulation().unwrap();
        out.finish().unwrap().to_vec()
    }

    fn assert_cycle(graph: &ValueGraph, root: ValueId) {
        let a = graph.get_as::<Node>(root).unwrap();
        assert_eq!(a.label, "a");
        let b_id = a.next.unwrap();
        let b = graph.get_as::<Node>(b_id).unwrap();
        assert_eq!(b.label, "b");
        assert!(graph.same(b.next.unwrap(), root));
    }

    #[test]
    fn test_cyclic_graph_all_encodings() {
        let registry = node_registry();
        for (encoding, format) in [
            (EncodingVersion::V1_0, FormatType::Compact),
            (EncodingVersion::V1_1, FormatType::Compact),
            (EncodingVersion::V1_1, FormatType::Sliced),
        ] {
            let mut graph = ValueGraph::new();
            let root = cycle(&mut graph);
            let bytes = encode_graph(encoding, format, &graph, root);

            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&registry);
            input.start_encapsulation().unwrap();
            let decoded = input.read_value().unwrap().unwrap();
            input.read_pending_values().unwrap();
            input.end_encapsulation().unwrap();
            let graph = input.take_graph();
            assert_cycle(&graph, decoded);

            let weight = graph.get_as::<Node>(decoded).unwrap().weight;
            if encoding == EncodingVersion::V1_0 {
                assert_eq!(weight, None);
            } else {
                assert_eq!(weight, Some(3));
            }
        }
    }

    #[test]
    fn test_1_0_layout() {
        let mut graph = ValueGraph::new();
        let node = graph.add(Node::default());
        let mut out = OutputStream::new(EncodingVersion::V1_0);
        out.write_value(&graph, Some(node)).unwrap();
        out.write_value(&graph, Some(node)).unwrap();
        assert_eq!(out.as_slice(), &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        out.write_pending_values(&graph).unwrap();
        let bytes = out.finish().unwrap();
        // one batch of one instance with index 1, terminated by an empty batch
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..13], &1i32.to_le_bytes());
        assert_eq!(bytes[bytes.len() - 1], 0);
    }

    #[test]
    fn test_1_0_pending_values_required() {
        let mut graph = ValueGraph::new();
        let node = graph.add(Node::default());
        let mut out = OutputStream::default();
        out.start_encapsulation(EncodingVersion::V1_0, FormatType::Compact)
            .unwrap();
        out.write_value(&graph, Some(node)).unwrap();
        assert!(matches!(out.end_encapsulation(), Err(CodecError::Misuse(_))));
    }

    #[test]
    fn test_1_0_unresolved_reference() {
        // reference to index 3, then an empty batch
        let bytes = [0xFD, 0xFF, 0xFF, 0xFF, 0];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_0);
        assert!(input.read_value().unwrap().is_some());
        assert_eq!(
            input.read_pending_values(),
            Err(CodecError::UnresolvedInstance(3))
        );
    }

    #[test]
    fn test_positive_1_0_reference_rejected() {
        let bytes = 1i32.to_le_bytes();
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_0);
        assert!(input.read_value().is_err());
    }

    #[test]
    fn test_no_factory_errors() {
        let mut graph = ValueGraph::new();
        let root = cycle(&mut graph);
        let empty = TypeRegistry::new();

        let bytes = encode_graph(EncodingVersion::V1_0, FormatType::Compact, &graph, root);
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&empty);
        input.start_encapsulation().unwrap();
        input.read_value().unwrap();
        assert_eq!(
            input.read_pending_values(),
            Err(CodecError::NoValueFactory("::Test::Node".into()))
        );

        let bytes = encode_graph(EncodingVersion::V1_1, FormatType::Compact, &graph, root);
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&empty);
        input.start_encapsulation().unwrap();
        assert_eq!(
            input.read_value(),
            Err(CodecError::NoValueFactory("::Test::Node".into()))
        );
    }

    #[test]
    fn test_unknown_instance_kept_as_sliced_value() {
        let mut graph = ValueGraph::new();
        let root = cycle(&mut graph);
        let bytes = encode_graph(EncodingVersion::V1_1, FormatType::Sliced, &graph, root);

        let empty = TypeRegistry::new();
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&empty);
        input.start_encapsulation().unwrap();
        let decoded = input.read_value().unwrap().unwrap();
        input.end_encapsulation().unwrap();
        let decoded_graph = input.take_graph();

        let unknown = decoded_graph
            .get_as::<UnknownSlicedValue>(decoded)
            .unwrap();
        assert_eq!(unknown.type_name(), "::Test::Node");
        let sliced = unknown.sliced_data().unwrap();
        assert_eq!(sliced.slices.len(), 1);
        assert!(sliced.slices[0].is_last);
        assert!(sliced.slices[0].has_optional_members);
        assert_eq!(sliced.slices[0].instances.len(), 1);

        // forwarding the opaque instance reproduces the original bytes
        let reencoded = encode_graph(
            EncodingVersion::V1_1,
            FormatType::Sliced,
            &decoded_graph,
            decoded,
        );
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn test_unknown_derived_slice_preserved() {
        let mut graph = ValueGraph::new();
        let root = graph.add(TaggedNode {
            base: Node {
                label: "base".into(),
                next: None,
                weight: Some(9),
            },
            tag: "extra".into(),
            sliced: SlicedData::default(),
        });
        let bytes = encode_graph(EncodingVersion::V1_1, FormatType::Sliced, &graph, root);

        let mut registry = TypeRegistry::new();
        registry.register_value::<PreservingNode>("::Test::Node");
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&registry);
        input.start_encapsulation().unwrap();
        let decoded = input.read_value().unwrap().unwrap();
        input.end_encapsulation().unwrap();
        let decoded_graph = input.take_graph();

        let node = decoded_graph.get_as::<PreservingNode>(decoded).unwrap();
        assert_eq!(node.inner.label, "base");
        assert_eq!(node.inner.weight, Some(9));
        assert_eq!(node.sliced.slices.len(), 1);
        assert_eq!(node.sliced.slices[0].type_id, "::Test::TaggedNode");
        assert!(!node.sliced.slices[0].is_last);

        let reencoded = encode_graph(
            EncodingVersion::V1_1,
            FormatType::Sliced,
            &decoded_graph,
            decoded,
        );
        assert_eq!(reencoded, bytes);

        // the original sender's type decodes the forwarded bytes in full
        let mut full = TypeRegistry::new();
        full.register_value::<TaggedNode>("::Test::TaggedNode");
        let mut input = InputStream::new(&reencoded, EncodingVersion::V1_1).with_registry(&full);
        input.start_encapsulation().unwrap();
        let id = input.read_value().unwrap().unwrap();
        assert_eq!(input.graph().get_as::<TaggedNode>(id).unwrap().tag, "extra");
    }

    #[test]
    fn test_compact_format_drops_preserved_slices() {
        let mut graph = ValueGraph::new();
        let mut node = PreservingNode::default();
        node.inner.label = "x".into();
        node.sliced.slices.push(crate::SliceInfo {
            type_id: "::Test::Lost".into(),
            compact_id: None,
            bytes: vec![1, 2, 3],
            instances: Vec::new(),
            has_optional_members: false,
            is_last: false,
        });
        let id = graph.add(node);
        let bytes = encode_graph(EncodingVersion::V1_1, FormatType::Compact, &graph, id);

        let registry = node_registry();
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&registry);
        input.start_encapsulation().unwrap();
        let decoded = input.read_value().unwrap().unwrap();
        input.end_encapsulation().unwrap();
        assert_eq!(input.graph().get_as::<Node>(decoded).unwrap().label, "x");
    }

    #[test]
    fn test_compact_id_resolution() {
        #[derive(Debug, Default)]
        struct Point {
            x: i32,
        }

        impl Value for Point {
            fn type_name(&self) -> &str {
                "::Test::Point"
            }

            fn write(&self, w: &mut InstanceWriter<'_>) -> Result<()> {
                w.start_slice("::Test::Point", Some(7), true)?;
                w.write_i32(self.x);
                w.end_slice()
            }

            fn read(&mut self, input: &mut InputStream<'_>) -> Result<()> {
                input.start_slice()?;
                self.x = input.read_i32()?;
                input.end_slice()
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        let mut graph = ValueGraph::new();
        let id = graph.add(Point { x: -4 });
        let bytes = encode_graph(EncodingVersion::V1_1, FormatType::Compact, &graph, id);

        let mut registry = TypeRegistry::new();
        registry.register_value_compact::<Point>("::Test::Point", 7);
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&registry);
        input.start_encapsulation().unwrap();
        let decoded = input.read_value().unwrap().unwrap();
        assert_eq!(input.graph().get_as::<Point>(decoded).unwrap().x, -4);

        let empty = TypeRegistry::new();
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&empty);
        input.start_encapsulation().unwrap();
        assert_eq!(input.read_value(), Err(CodecError::UnknownCompactId(7)));
    }

    #[test]
    fn test_class_depth_limit() {
        let mut graph = ValueGraph::new();
        let mut next = None;
        for i in 0..10 {
            next = Some(graph.add(Node {
                label: i.to_string(),
                next,
                weight: None,
            }));
        }
        let bytes = encode_graph(
            EncodingVersion::V1_1,
            FormatType::Compact,
            &graph,
            next.unwrap(),
        );
        let registry = node_registry();
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1)
            .with_registry(&registry)
            .with_max_class_depth(5);
        input.start_encapsulation().unwrap();
        assert!(matches!(input.read_value(), Err(CodecError::InvalidData(_))));
    }

    fn encode_exception(encoding: EncodingVersion, format: FormatType, exception: &dyn UserException) -> Vec<u8> {
        let mut out = OutputStream::default();
        out.start_encapsulation(encoding, format).unwrap();
        out.write_exception(exception).unwrap();
        out.end_encapsulation().unwrap();
        out.finish().unwrap().to_vec()
    }

    fn decode_exception(bytes: &[u8], registry: &TypeRegistry) -> Box<dyn UserException> {
        let mut input = InputStream::new(bytes, EncodingVersion::V1_1).with_registry(registry);
        input.start_encapsulation().unwrap();
        let exception = input.read_exception().unwrap();
        input.end_encapsulation().unwrap();
        exception
    }

    #[test]
    fn test_exception_known_type() {
        let error = DerivedError {
            code: 42,
            base: BaseError {
                reason: "boom".into(),
            },
        };
        let mut registry = TypeRegistry::new();
        registry.register_exception::<DerivedError>("::Test::DerivedError");
        for (encoding, format) in [
            (EncodingVersion::V1_0, FormatType::Compact),
            (EncodingVersion::V1_1, FormatType::Compact),
            (EncodingVersion::V1_1, FormatType::Sliced),
        ] {
            let bytes = encode_exception(encoding, format, &error);
            let decoded = decode_exception(&bytes, &registry);
            let decoded = decoded.as_any().downcast_ref::<DerivedError>().unwrap();
            assert_eq!(decoded.code, 42);
            assert_eq!(decoded.base.reason, "boom");
        }
    }

    #[test]
    fn test_exception_with_class_member() {
        let mut values = ValueGraph::new();
        let root = cycle(&mut values);
        let error = NodeError {
            node: Some(root),
            values,
        };
        let mut registry = node_registry();
        registry.register_exception::<NodeError>("::Test::NodeError");

        for (encoding, format) in [
            (EncodingVersion::V1_0, FormatType::Compact),
            (EncodingVersion::V1_1, FormatType::Compact),
        ] {
            let bytes = encode_exception(encoding, format, &error);
            if encoding == EncodingVersion::V1_0 {
                // "uses classes" follows the encapsulation header
                assert_eq!(bytes[6], 1);
            }

            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1).with_registry(&registry);
            input.start_encapsulation().unwrap();
            let exception = input.read_exception().unwrap();
            input.end_encapsulation().unwrap();
            let decoded = exception.as_any().downcast_ref::<NodeError>().unwrap();

            let graph = input.take_graph();
            let a = decoded.node.unwrap();
            let a_node = graph.get_as::<Node>(a).unwrap();
            assert_eq!(a_node.label, "a");
            let b = a_node.next.unwrap();
            let b_node = graph.get_as::<Node>(b).unwrap();
            assert_eq!(b_node.label, "b");
            assert!(graph.same(b_node.next.unwrap(), a));
        }
    }

    #[test]
    fn test_exception_without_classes_leaves_flag_clear() {
        let bytes = encode_exception(EncodingVersion::V1_0, FormatType::Compact, &BaseError::default());
        assert_eq!(bytes[6], 0);
    }

    #[test]
    fn test_exception_sliced_to_base() {
        let error = DerivedError {
            code: 1,
            base: BaseError {
                reason: "sliced".into(),
            },
        };
        let mut registry = TypeRegistry::new();
        registry.register_exception::<BaseError>("::Test::BaseError");
        for encoding in [EncodingVersion::V1_0, EncodingVersion::V1_1] {
            let bytes = encode_exception(encoding, FormatType::Sliced, &error);
            let decoded = decode_exception(&bytes, &registry);
            let decoded = decoded.as_any().downcast_ref::<BaseError>().unwrap();
            assert_eq!(decoded.reason, "sliced");
        }
    }

    #[test]
    fn test_exception_unknown_type() {
        let error = DerivedError::default();
        let empty = TypeRegistry::new();
        for (encoding, format) in [
            (EncodingVersion::V1_0, FormatType::Compact),
            (EncodingVersion::V1_1, FormatType::Compact),
            (EncodingVersion::V1_1, FormatType::Sliced),
        ] {
            let bytes = encode_exception(encoding, format, &error);
            let decoded = decode_exception(&bytes, &empty);
            let unknown = decoded
                .as_any()
                .downcast_ref::<UnknownUserException>()
                .unwrap();
            assert_eq!(unknown.type_id, "::Test::DerivedError");
        }
    }
}
