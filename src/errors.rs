//! Error types for the Lumen client driver.
//!
//! Every failure surfaces as a single [`Error`] carrying a hierarchical
//! [`ErrorCode`]. Categories nest by code prefix: `TRANSACTION` includes
//! `TRANSACTION_SERIALIZATION`, `QUERY` includes `INVALID_SYNTAX`, and so
//! on. Callers match on categories with [`Error::is`] and can still reach
//! the underlying cause through `std::error::Error::source`.

use std::fmt;
use std::io;

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Hierarchical error code.
///
/// The four bytes read most-significant first; a category includes a code
/// when every non-zero byte of the category matches the code. Server
/// errors arrive with their code on the wire, client-side errors use the
/// `0xFF`-prefixed space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const PROTOCOL: ErrorCode = ErrorCode(0x0300_0000);

    pub const QUERY: ErrorCode = ErrorCode(0x0400_0000);
    pub const INVALID_SYNTAX: ErrorCode = ErrorCode(0x0401_0000);
    pub const INVALID_TYPE: ErrorCode = ErrorCode(0x0402_0000);
    pub const MISSING_REQUIRED: ErrorCode = ErrorCode(0x0403_0000);
    pub const RESULT_CARDINALITY_MISMATCH: ErrorCode = ErrorCode(0x0404_0000);
    pub const NO_DATA: ErrorCode = ErrorCode(0x0405_0000);
    pub const DISABLED_CAPABILITY: ErrorCode = ErrorCode(0x0406_0000);

    pub const EXECUTION: ErrorCode = ErrorCode(0x0500_0000);
    pub const INTEGRITY: ErrorCode = ErrorCode(0x0502_0000);
    pub const TRANSACTION: ErrorCode = ErrorCode(0x0503_0000);
    pub const TRANSACTION_SERIALIZATION: ErrorCode = ErrorCode(0x0503_0100);
    pub const TRANSACTION_DEADLOCK: ErrorCode = ErrorCode(0x0503_0200);

    pub const AUTHENTICATION: ErrorCode = ErrorCode(0x0701_0000);

    pub const CLIENT: ErrorCode = ErrorCode(0xFF00_0000);
    pub const CLIENT_CONNECTION: ErrorCode = ErrorCode(0xFF01_0000);
    pub const INTERFACE: ErrorCode = ErrorCode(0xFF02_0000);

    /// True when `self`, read as a category, includes `code`.
    pub fn includes(self, code: ErrorCode) -> bool {
        for shift in [24u32, 16, 8, 0] {
            let cat_byte = (self.0 >> shift) & 0xFF;
            if cat_byte == 0 {
                return true;
            }
            if cat_byte != (code.0 >> shift) & 0xFF {
                return false;
            }
        }
        true
    }

    /// Human name of the most specific known category for this code.
    pub fn name(self) -> &'static str {
        const TABLE: &[(ErrorCode, &str)] = &[
            (ErrorCode::TRANSACTION_SERIALIZATION, "TransactionSerializationError"),
            (ErrorCode::TRANSACTION_DEADLOCK, "TransactionDeadlockError"),
            (ErrorCode::TRANSACTION, "TransactionError"),
            (ErrorCode::INTEGRITY, "IntegrityError"),
            (ErrorCode::EXECUTION, "ExecutionError"),
            (ErrorCode::INVALID_SYNTAX, "InvalidSyntaxError"),
            (ErrorCode::INVALID_TYPE, "InvalidTypeError"),
            (ErrorCode::MISSING_REQUIRED, "MissingRequiredError"),
            (ErrorCode::RESULT_CARDINALITY_MISMATCH, "ResultCardinalityMismatchError"),
            (ErrorCode::NO_DATA, "NoDataError"),
            (ErrorCode::DISABLED_CAPABILITY, "DisabledCapabilityError"),
            (ErrorCode::QUERY, "QueryError"),
            (ErrorCode::AUTHENTICATION, "AuthenticationError"),
            (ErrorCode::PROTOCOL, "ProtocolError"),
            (ErrorCode::CLIENT_CONNECTION, "ClientConnectionError"),
            (ErrorCode::INTERFACE, "InterfaceError"),
            (ErrorCode::CLIENT, "ClientError"),
        ];
        for (cat, name) in TABLE {
            if cat.includes(self) {
                return name;
            }
        }
        "Error"
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A driver error: category code, message, optional server attributes and
/// an optional underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("{}", display_error(.code, .message))]
pub struct Error {
    code: ErrorCode,
    message: String,
    attributes: Vec<(u16, String)>,
    /// Set when the failure happened after a COMMIT was sent but before
    /// its completion was observed: the transaction's effects may or may
    /// not have been applied, so the attempt must not be retried.
    effects_unknown: bool,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attributes: Vec::new(),
            effects_unknown: false,
            source: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PROTOCOL, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AUTHENTICATION, message)
    }

    pub fn interface(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERFACE, message)
    }

    pub fn client_connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CLIENT_CONNECTION, message)
    }

    pub fn invalid_type(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_TYPE, message)
    }

    pub fn missing_required(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MISSING_REQUIRED, message)
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NO_DATA, message)
    }

    pub fn cardinality_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RESULT_CARDINALITY_MISMATCH, message)
    }

    pub fn disabled_capability(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DISABLED_CAPABILITY, message)
    }

    /// Wrap a transport failure. Transport errors are never surfaced
    /// bare: they become `ClientConnectionError`s with the cause attached
    /// so callers can still unwrap it for diagnostics.
    pub fn transport(err: io::Error) -> Self {
        Self::client_connection(err.to_string()).with_source(err)
    }

    /// A server-sent error decoded from the wire.
    pub fn from_server(code: u32, message: String, attributes: Vec<(u16, String)>) -> Self {
        Self {
            code: ErrorCode(code),
            message,
            attributes,
            effects_unknown: false,
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_effects_unknown(mut self) -> Self {
        self.effects_unknown = true;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn attributes(&self) -> &[(u16, String)] {
        &self.attributes
    }

    /// True when this error falls inside `category`.
    pub fn is(&self, category: ErrorCode) -> bool {
        category.includes(self.code)
    }

    pub fn effects_unknown(&self) -> bool {
        self.effects_unknown
    }

    /// Append a wire path segment (`.name` or `[idx]`) to a codec error
    /// message, innermost segment first.
    pub fn at_path(mut self, segment: &str) -> Self {
        self.message = format!("at {}{}", segment, rest_of_path(&self.message));
        self
    }
}

fn display_error(code: &ErrorCode, message: &str) -> String {
    format!("{}: {}", code.name(), message)
}

fn rest_of_path(message: &str) -> String {
    match message.strip_prefix("at ") {
        Some(rest) => rest.to_string(),
        None => format!(": {}", message),
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::transport(err)
    }
}
