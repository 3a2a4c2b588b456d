//! Error taxonomy shared by the dispatcher and the method state machines.

use thiserror::Error;

/// Errors surfaced by configuration-method operations.
///
/// Shape errors (`InvalidParameter`, `InvalidOperation`,
/// `OperationNotSupported`) are detected at start and prevent any kernel
/// mutation. `AddressInUse`, `MediaInactive` and `NoRouterResponse` describe
/// runtime conditions reported through the store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("operation not valid for this interface: {0}")]
    InvalidOperation(String),

    #[error("allocation failed")]
    AllocationFailed,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration method not supported: {0}")]
    OperationNotSupported(String),

    #[error("address already in use: {0}")]
    AddressInUse(std::net::Ipv6Addr),

    #[error("link media inactive")]
    MediaInactive,

    #[error("no router advertisement received")]
    NoRouterResponse,

    #[error("system error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Stable kind string, used for failure publication in the store.
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::InvalidParameter(_) => "invalid-parameter",
            ConfigError::InvalidOperation(_) => "invalid-operation",
            ConfigError::AllocationFailed => "allocation-failed",
            ConfigError::Internal(_) => "internal-error",
            ConfigError::OperationNotSupported(_) => "operation-not-supported",
            ConfigError::AddressInUse(_) => "address-in-use",
            ConfigError::MediaInactive => "media-inactive",
            ConfigError::NoRouterResponse => "no-rtadv-response",
            ConfigError::Io(_) => "internal-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_kind_strings() {
        assert_eq!(
            ConfigError::InvalidParameter("x".into()).kind(),
            "invalid-parameter"
        );
        assert_eq!(ConfigError::MediaInactive.kind(), "media-inactive");
        assert_eq!(ConfigError::NoRouterResponse.kind(), "no-rtadv-response");
        assert_eq!(
            ConfigError::AddressInUse(Ipv6Addr::LOCALHOST).kind(),
            "address-in-use"
        );
    }
}
