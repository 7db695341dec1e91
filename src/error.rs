//! Error types for the C2S engine.
//!
//! Three protocol error planes coexist: stream errors are fatal and close
//! the stream, stanza errors are returned as errored copies of the
//! offending stanza, and SASL errors reset the active mechanism without
//! closing the stream. `XmppError` covers everything else (IO, TLS,
//! storage, internal faults) and is never sent to the peer as-is.

use thiserror::Error;

/// Engine-internal errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Fatal stream error conditions (RFC 6120 Section 4.9.3).
///
/// Writing one of these closes the stream; there is no recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// The stream open is addressed to a domain this server does not serve
    HostUnknown,
    /// Connect timeout expired before a stream open arrived
    ConnectionTimeout,
    /// Entity sent XML that cannot be processed
    InvalidXml,
    /// Wrong namespace on a stream-level element
    InvalidNamespace,
    /// The 'from' address does not match the authenticated JID
    InvalidFrom,
    /// Entity attempted an action it is not authorized for
    NotAuthorized,
    /// Entity violated a local policy (e.g. stanza size limit)
    PolicyViolation,
    /// Server lacks resources to service the stream
    ResourceConstraint,
    /// Top-level element is not a valid stanza
    UnsupportedStanzaType,
    /// Stream version is not supported
    UnsupportedVersion,
    /// Server-side fault that must not be detailed to the peer
    InternalServerError,
}

impl StreamErrorKind {
    /// Get the defined-condition element name for this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostUnknown => "host-unknown",
            Self::ConnectionTimeout => "connection-timeout",
            Self::InvalidXml => "invalid-xml",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidFrom => "invalid-from",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::ResourceConstraint => "resource-constraint",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
            Self::InternalServerError => "internal-server-error",
        }
    }

    /// Serialize to the `<stream:error>` wire form.
    pub fn to_xml(&self) -> String {
        format!(
            "<stream:error><{} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
            self.as_str()
        )
    }
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recoverable stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed stanza)
    BadRequest,
    /// Conflict (e.g. resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Service unavailable
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SASL failure conditions (RFC 6120 Section 6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslErrorKind {
    /// Client aborted the exchange
    Aborted,
    /// Response data could not be decoded
    IncorrectEncoding,
    /// Authzid does not match the authenticated identity
    InvalidAuthzid,
    /// Requested mechanism is not offered
    InvalidMechanism,
    /// Request violates the mechanism grammar
    MalformedRequest,
    /// Mechanism is weaker than server policy permits
    MechanismTooWeak,
    /// Credentials were not accepted
    NotAuthorized,
    /// Transient server-side failure
    TemporaryAuthFailure,
}

impl SaslErrorKind {
    /// Get the condition element name for this failure.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

impl std::fmt::Display for SaslErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
