//! Registry error types.

use crate::request::RequestId;
use crate::session::SessionId;
use thiserror::Error;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Request storage could not be obtained
    #[error("out of memory: request pool exhausted at {limit} live requests")]
    OutOfMemory {
        /// Configured pool bound that was hit
        limit: usize,
    },

    /// Attach attempted without a session
    #[error("session is null")]
    NullSession,

    /// Strict detach named a session the request is not attached to
    #[error("request {request} is not attached to session {session}")]
    NotAttached {
        /// Request that was being detached
        request: RequestId,
        /// Session it was expected on
        session: SessionId,
    },
}
