//! Dispatch of incoming requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tandem_codec::Identity;
use thiserror::Error;

use crate::cancel::CancelSignal;
use crate::protocol::{IncomingRequest, OutgoingResponse, RemoteException};

/// Why a dispatch did not produce a response of its own
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Failure reported to the caller as is
    #[error(transparent)]
    Remote(#[from] RemoteException),

    /// Unexpected failure, reported as `UnknownException`
    #[error("unhandled dispatch failure: {0}")]
    Unhandled(String),
}

impl DispatchError {
    /// Wrap any error as an unhandled failure
    pub fn unhandled(error: impl fmt::Display) -> Self {
        Self::Unhandled(error.to_string())
    }

    /// The response sent to the caller for this failure
    #[must_use]
    pub fn into_response(self) -> OutgoingResponse {
        match self {
            Self::Remote(e) => OutgoingResponse::Exception(e),
            Self::Unhandled(message) => OutgoingResponse::Exception(RemoteException::Unknown(message)),
        }
    }
}

/// Per-request information handed to a [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Description of the connection the request arrived on
    pub connection: Arc<str>,
    /// Stream carrying the request
    pub stream_id: u64,
    /// Fired if the peer resets the stream or the connection aborts
    pub cancel: CancelSignal,
}

/// Handler for incoming requests
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Handle one request.
    ///
    /// The response of a oneway request is discarded.
    ///
    /// # Errors
    /// A [`DispatchError`] is turned into an exception response; it never
    /// affects the connection
    async fn dispatch(
        &self,
        request: IncomingRequest,
        context: DispatchContext,
    ) -> Result<OutgoingResponse, DispatchError>;
}

/// Dispatcher routing requests to servants by identity
#[derive(Default)]
pub struct ServantMap {
    servants: HashMap<Identity, Arc<dyn Dispatcher>>,
}

impl ServantMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `servant` under `identity`, returning the servant it replaces
    pub fn insert(
        &mut self,
        identity: Identity,
        servant: Arc<dyn Dispatcher>,
    ) -> Option<Arc<dyn Dispatcher>> {
        self.servants.insert(identity, servant)
    }

    /// Remove the servant registered under `identity`
    pub fn remove(&mut self, identity: &Identity) -> Option<Arc<dyn Dispatcher>> {
        self.servants.remove(identity)
    }

    /// Servant registered under `identity`
    #[must_use]
    pub fn get(&self, identity: &Identity) -> Option<&Arc<dyn Dispatcher>> {
        self.servants.get(identity)
    }

    /// Number of registered servants
    #[must_use]
    pub fn len(&self) -> usize {
        self.servants.len()
    }

    /// Whether no servant is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servants.is_empty()
    }
}

impl fmt::Debug for ServantMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServantMap")
            .field("identities", &self.servants.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Dispatcher for ServantMap {
    async fn dispatch(
        &self,
        request: IncomingRequest,
        context: DispatchContext,
    ) -> Result<OutgoingResponse, DispatchError> {
        match self.servants.get(&request.identity) {
            Some(servant) => servant.dispatch(request, context).await,
            None => Err(RemoteException::object_not_exist(&request).into()),
        }
    }
}
