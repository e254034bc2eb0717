//! Request and response frames carried on streams.
//!
//! ```text
//! request:  identity (name, category) | facet (string seq, 0 or 1)
//!           | operation | idempotent (bool) | context (string dict)
//!           | payload (encapsulation)
//! response: status (byte) | body
//! ```
//!
//! The response body depends on the status: an encapsulation for `Ok` and
//! `UserException`, identity, facet and operation for the `*NotExist`
//! statuses, and a message string for the `Unknown*` statuses.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use tandem_codec::{CodecError, EncodingVersion, FormatType, Identity, InputStream, OutputStream};
use thiserror::Error;

const FRAME_ENCODING: EncodingVersion = EncodingVersion::V1_1;

/// Reply status of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    /// The operation returned normally
    Ok = 0,
    /// The operation raised a declared user exception
    UserException = 1,
    /// No servant for the identity
    ObjectNotExist = 2,
    /// The servant has no such facet
    FacetNotExist = 3,
    /// The servant has no such operation
    OperationNotExist = 4,
    /// A local exception escaped the dispatch
    UnknownLocalException = 5,
    /// An undeclared user exception escaped the dispatch
    UnknownUserException = 6,
    /// Any other failure
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::UserException),
            2 => Ok(Self::ObjectNotExist),
            3 => Ok(Self::FacetNotExist),
            4 => Ok(Self::OperationNotExist),
            5 => Ok(Self::UnknownLocalException),
            6 => Ok(Self::UnknownUserException),
            7 => Ok(Self::UnknownException),
            other => Err(CodecError::invalid(format!("invalid reply status {other}"))),
        }
    }
}

/// Build an encapsulation holding whatever `write` puts in it.
///
/// # Errors
/// Returns the first codec error raised by `write`
pub fn encapsulate<F>(write: F) -> Result<Bytes, CodecError>
where
    F: FnOnce(&mut OutputStream) -> Result<(), CodecError>,
{
    let mut out = OutputStream::new(FRAME_ENCODING);
    out.start_encapsulation(FRAME_ENCODING, FormatType::Compact)?;
    write(&mut out)?;
    out.end_encapsulation()?;
    out.finish()
}

/// An empty encapsulation, for operations without parameters
#[must_use]
pub fn empty_payload() -> Bytes {
    let mut out = OutputStream::new(FRAME_ENCODING);
    out.write_empty_encapsulation(FRAME_ENCODING);
    Bytes::copy_from_slice(out.as_slice())
}

fn write_identity(out: &mut OutputStream, identity: &Identity) {
    out.write_string(&identity.name);
    out.write_string(&identity.category);
}

fn read_identity(input: &mut InputStream<'_>) -> Result<Identity, CodecError> {
    let name = input.read_string()?;
    let category = input.read_string()?;
    Ok(Identity { name, category })
}

fn write_facet(out: &mut OutputStream, facet: Option<&str>) {
    match facet {
        Some(facet) => out.write_string_seq(&[facet]),
        None => out.write_size(0),
    }
}

fn read_facet(input: &mut InputStream<'_>) -> Result<Option<String>, CodecError> {
    let mut facets = input.read_string_seq()?;
    match facets.len() {
        0 => Ok(None),
        1 => Ok(facets.pop()),
        n => Err(CodecError::invalid(format!("facet sequence with {n} elements"))),
    }
}

fn expect_end(input: &InputStream<'_>, what: &str) -> Result<(), CodecError> {
    if input.is_empty() {
        Ok(())
    } else {
        Err(CodecError::invalid(format!(
            "{} trailing bytes after {what}",
            input.remaining()
        )))
    }
}

/// A request to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    /// Target object
    pub identity: Identity,
    /// Target facet
    pub facet: Option<String>,
    /// Operation name
    pub operation: String,
    /// Whether the operation may safely run twice
    pub idempotent: bool,
    /// Request context
    pub context: BTreeMap<String, String>,
    /// Encoded parameters (an encapsulation)
    pub payload: Bytes,
    /// Send without waiting for a response
    pub oneway: bool,
}

impl OutgoingRequest {
    /// Create a two-way request
    pub fn new(identity: Identity, operation: impl Into<String>, payload: Bytes) -> Self {
        Self {
            identity,
            facet: None,
            operation: operation.into(),
            idempotent: false,
            context: BTreeMap::new(),
            payload,
            oneway: false,
        }
    }

    /// Target a facet
    #[must_use]
    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = Some(facet.into());
        self
    }

    /// Add a context entry
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Mark the operation idempotent
    #[must_use]
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Send on a unidirectional stream without a response
    #[must_use]
    pub fn oneway(mut self) -> Self {
        self.oneway = true;
        self
    }

    /// Encode the request frame.
    ///
    /// # Errors
    /// Returns `CodecError::InvalidEncapsulation` if the payload is not a
    /// well-formed encapsulation
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut out = OutputStream::new(FRAME_ENCODING);
        write_identity(&mut out, &self.identity);
        write_facet(&mut out, self.facet.as_deref());
        out.write_string(&self.operation);
        out.write_bool(self.idempotent);
        out.write_string_dict(&self.context);
        out.write_encapsulation_bytes(&self.payload)?;
        out.finish()
    }
}

/// A request received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    /// Target object
    pub identity: Identity,
    /// Target facet
    pub facet: Option<String>,
    /// Operation name
    pub operation: String,
    /// Whether the operation may safely run twice
    pub idempotent: bool,
    /// Request context
    pub context: BTreeMap<String, String>,
    /// Encoded parameters (an encapsulation)
    pub payload: Bytes,
    /// Encoding of the payload
    pub payload_encoding: EncodingVersion,
    /// Received on a unidirectional stream; no response is sent
    pub oneway: bool,
}

impl IncomingRequest {
    /// Decode a request frame.
    ///
    /// # Errors
    /// Returns a `CodecError` for truncated or malformed frames
    pub fn decode(frame: &Bytes, oneway: bool) -> Result<Self, CodecError> {
        let mut input = InputStream::new(frame, FRAME_ENCODING);
        let identity = read_identity(&mut input)?;
        let facet = read_facet(&mut input)?;
        let operation = input.read_string()?;
        let idempotent = input.read_bool()?;
        let context = input.read_string_dict()?;
        let start = input.position();
        let (encapsulation, payload_encoding) = input.read_encapsulation_bytes()?;
        let payload = frame.slice(start..start + encapsulation.len());
        expect_end(&input, "request")?;
        Ok(Self {
            identity,
            facet,
            operation,
            idempotent,
            context,
            payload,
            payload_encoding,
            oneway,
        })
    }

    /// Read the payload's contents with `read`
    ///
    /// # Errors
    /// Returns the first codec error raised by `read` or by the encapsulation
    /// checks
    pub fn read_payload<T, F>(&self, read: F) -> Result<T, CodecError>
    where
        F: FnOnce(&mut InputStream<'_>) -> Result<T, CodecError>,
    {
        let mut input = InputStream::new(&self.payload, FRAME_ENCODING);
        input.start_encapsulation()?;
        let value = read(&mut input)?;
        input.end_encapsulation()?;
        Ok(value)
    }
}

/// Failure reported by the peer in place of a result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteException {
    /// No servant for the identity
    #[error("object `{identity}` does not exist (operation `{operation}`)")]
    ObjectNotExist {
        /// Target object
        identity: Identity,
        /// Target facet
        facet: Option<String>,
        /// Operation name
        operation: String,
    },

    /// The servant has no such facet
    #[error("facet `{}` of `{identity}` does not exist", facet.as_deref().unwrap_or_default())]
    FacetNotExist {
        /// Target object
        identity: Identity,
        /// Target facet
        facet: Option<String>,
        /// Operation name
        operation: String,
    },

    /// The servant has no such operation
    #[error("operation `{operation}` does not exist on `{identity}`")]
    OperationNotExist {
        /// Target object
        identity: Identity,
        /// Target facet
        facet: Option<String>,
        /// Operation name
        operation: String,
    },

    /// A declared user exception, still encoded
    #[error("user exception")]
    User(Bytes),

    /// A local exception escaped the peer's dispatch
    #[error("unknown local exception: {0}")]
    UnknownLocal(String),

    /// An undeclared user exception escaped the peer's dispatch
    #[error("unknown user exception: {0}")]
    UnknownUser(String),

    /// Any other failure of the peer's dispatch
    #[error("unknown exception: {0}")]
    Unknown(String),
}

impl RemoteException {
    /// Reply status this exception travels with
    #[must_use]
    pub fn status(&self) -> ReplyStatus {
        match self {
            Self::ObjectNotExist { .. } => ReplyStatus::ObjectNotExist,
            Self::FacetNotExist { .. } => ReplyStatus::FacetNotExist,
            Self::OperationNotExist { .. } => ReplyStatus::OperationNotExist,
            Self::User(_) => ReplyStatus::UserException,
            Self::UnknownLocal(_) => ReplyStatus::UnknownLocalException,
            Self::UnknownUser(_) => ReplyStatus::UnknownUserException,
            Self::Unknown(_) => ReplyStatus::UnknownException,
        }
    }

    /// `ObjectNotExist` for the target of `request`
    #[must_use]
    pub fn object_not_exist(request: &IncomingRequest) -> Self {
        Self::ObjectNotExist {
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
        }
    }

    /// `OperationNotExist` for the target of `request`
    #[must_use]
    pub fn operation_not_exist(request: &IncomingRequest) -> Self {
        Self::OperationNotExist {
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
        }
    }
}

/// A response to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingResponse {
    /// Normal result (an encapsulation)
    Ok(Bytes),
    /// Failure
    Exception(RemoteException),
}

impl OutgoingResponse {
    /// Reply status of this response
    #[must_use]
    pub fn status(&self) -> ReplyStatus {
        match self {
            Self::Ok(_) => ReplyStatus::Ok,
            Self::Exception(e) => e.status(),
        }
    }

    /// Encode the response frame.
    ///
    /// # Errors
    /// Returns `CodecError::InvalidEncapsulation` if a result or user
    /// exception payload is not a well-formed encapsulation
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut out = OutputStream::new(FRAME_ENCODING);
        out.write_u8(self.status() as u8);
        match self {
            Self::Ok(payload) | Self::Exception(RemoteException::User(payload)) => {
                out.write_encapsulation_bytes(payload)?;
            }
            Self::Exception(
                RemoteException::ObjectNotExist {
                    identity,
                    facet,
                    operation,
                }
                | RemoteException::FacetNotExist {
                    identity,
                    facet,
                    operation,
                }
                | RemoteException::OperationNotExist {
                    identity,
                    facet,
                    operation,
                },
            ) => {
                write_identity(&mut out, identity);
                write_facet(&mut out, facet.as_deref());
                out.write_string(operation);
            }
            Self::Exception(
                RemoteException::UnknownLocal(message)
                | RemoteException::UnknownUser(message)
                | RemoteException::Unknown(message),
            ) => out.write_string(message),
        }
        out.finish()
    }
}

impl From<RemoteException> for OutgoingResponse {
    fn from(e: RemoteException) -> Self {
        Self::Exception(e)
    }
}

/// A response received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingResponse {
    /// Reply status
    pub status: ReplyStatus,
    result: Result<Bytes, RemoteException>,
}

impl IncomingResponse {
    /// Decode a response frame.
    ///
    /// # Errors
    /// Returns a `CodecError` for truncated or malformed frames and unknown
    /// statuses
    pub fn decode(frame: &Bytes) -> Result<Self, CodecError> {
        let mut input = InputStream::new(frame, FRAME_ENCODING);
        let status = ReplyStatus::try_from(input.read_u8()?)?;
        let result = match status {
            ReplyStatus::Ok | ReplyStatus::UserException => {
                let start = input.position();
                let (encapsulation, _) = input.read_encapsulation_bytes()?;
                let payload = frame.slice(start..start + encapsulation.len());
                if status == ReplyStatus::Ok {
                    Ok(payload)
                } else {
                    Err(RemoteException::User(payload))
                }
            }
            ReplyStatus::ObjectNotExist
            | ReplyStatus::FacetNotExist
            | ReplyStatus::OperationNotExist => {
                let identity = read_identity(&mut input)?;
                let facet = read_facet(&mut input)?;
                let operation = input.read_string()?;
                Err(match status {
                    ReplyStatus::ObjectNotExist => RemoteException::ObjectNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    ReplyStatus::FacetNotExist => RemoteException::FacetNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    _ => RemoteException::OperationNotExist {
                        identity,
                        facet,
                        operation,
                    },
                })
            }
            ReplyStatus::UnknownLocalException => {
                Err(RemoteException::UnknownLocal(input.read_string()?))
            }
            ReplyStatus::UnknownUserException => {
                Err(RemoteException::UnknownUser(input.read_string()?))
            }
            ReplyStatus::UnknownException => Err(RemoteException::Unknown(input.read_string()?)),
        };
        expect_end(&input, "response")?;
        Ok(Self { status, result })
    }

    /// The result payload, or the peer's failure
    ///
    /// # Errors
    /// Returns the [`RemoteException`] carried by a non-`Ok` response
    pub fn into_result(self) -> Result<Bytes, RemoteException> {
        self.result
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_payload(value: &str) -> Bytes {
        encapsulate(|out| {
            out.write_string(value);
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_request_frame() {
        let request = OutgoingRequest::new(
            Identity::with_category("echo", "tandem"),
            "echo",
            string_payload("hello"),
        )
        .with_facet("v2")
        .with_context("trace", "abc")
        .idempotent();

        let frame = request.encode().unwrap();
        let incoming = IncomingRequest::decode(&frame, false).unwrap();
        assert_eq!(incoming.identity, request.identity);
        assert_eq!(incoming.facet.as_deref(), Some("v2"));
        assert_eq!(incoming.operation, "echo");
        assert!(incoming.idempotent);
        assert_eq!(incoming.context.get("trace").map(String::as_str), Some("abc"));
        assert_eq!(incoming.payload, request.payload);
        assert_eq!(incoming.payload_encoding, EncodingVersion::V1_1);
        assert_eq!(incoming.read_payload(|input| input.read_string()).unwrap(), "hello");
    }

    #[test]
    fn test_request_rejects_bad_payload() {
        let request = OutgoingRequest::new(Identity::new("a"), "op", Bytes::from_static(b"xyz"));
        assert!(request.encode().is_err());

        let good = OutgoingRequest::new(Identity::new("a"), "op", empty_payload());
        let mut frame = good.encode().unwrap().to_vec();
        frame.push(0);
        assert!(IncomingRequest::decode(&Bytes::from(frame), false).is_err());
    }

    #[test]
    fn test_ok_response() {
        let payload = string_payload("result");
        let frame = OutgoingResponse::Ok(payload.clone()).encode().unwrap();
        assert_eq!(frame[0], 0);
        let response = IncomingResponse::decode(&frame).unwrap();
        assert_eq!(response.status, ReplyStatus::Ok);
        assert_eq!(response.into_result().unwrap(), payload);
    }

    #[test]
    fn test_exception_responses() {
        let request = IncomingRequest::decode(
            &OutgoingRequest::new(Identity::new("missing"), "op", empty_payload())
                .encode()
                .unwrap(),
            false,
        )
        .unwrap();

        let cases = [
            RemoteException::object_not_exist(&request),
            RemoteException::operation_not_exist(&request),
            RemoteException::FacetNotExist {
                identity: Identity::new("x"),
                facet: Some("f".to_string()),
                operation: "op".to_string(),
            },
            RemoteException::User(string_payload("boom")),
            RemoteException::UnknownLocal("local".to_string()),
            RemoteException::UnknownUser("user".to_string()),
            RemoteException::Unknown("unhandled".to_string()),
        ];
        for exception in cases {
            let frame = OutgoingResponse::from(exception.clone()).encode().unwrap();
            let response = IncomingResponse::decode(&frame).unwrap();
            assert_eq!(response.status, exception.status());
            assert_eq!(response.into_result().unwrap_err(), exception);
        }
    }

    #[test]
    fn test_invalid_status() {
        assert!(IncomingResponse::decode(&Bytes::from_static(&[8])).is_err());
        assert!(IncomingResponse::decode(&Bytes::from_static(&[7])).is_err());
    }
}
