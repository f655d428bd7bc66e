//! binlog2sql error types

use mysql_async::DriverError;
use std::io;
use thiserror::Error;

/// MySQL client error: lost connection to server during query
pub const CR_SERVER_LOST: u16 = 2013;
/// MySQL client error: server has gone away
pub const CR_SERVER_GONE_ERROR: u16 = 2006;

#[derive(Error, Debug)]
pub enum Binlog2SqlError {
    #[error("malformed binlog at position {position}: {reason}")]
    MalformedLog { position: u64, reason: String },

    #[error("table metadata unavailable for table id {table_id} at position {position}: {reason}")]
    MetadataUnavailable {
        table_id: u64,
        position: u64,
        reason: String,
    },

    #[error("incompatible options: {0}")]
    IncompatibleOptions(String),

    #[error("unsupported event for sql generation: {0}")]
    UnsupportedEvent(String),

    #[error("binlog parse error at position {position}: {reason}")]
    BinlogParseError { position: u64, reason: String },

    #[error("GTID error: {0}")]
    GtidError(String),

    #[error("invalid filter condition: {0}")]
    ConditionError(String),

    #[error("MySQL connection error: {0}")]
    ConnectionError(String),

    #[error("query error ({code}): {message}")]
    QueryError { code: u16, message: String },

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Binlog2SqlError {
    /// Whether a catalog lookup that failed with this error may be retried
    /// on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Binlog2SqlError::QueryError { code, .. }
                if *code == CR_SERVER_LOST || *code == CR_SERVER_GONE_ERROR
        )
    }

    pub fn parse(position: u64, reason: impl Into<String>) -> Self {
        Binlog2SqlError::BinlogParseError {
            position,
            reason: reason.into(),
        }
    }

    pub fn malformed(position: u64, reason: impl Into<String>) -> Self {
        Binlog2SqlError::MalformedLog {
            position,
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for Binlog2SqlError {
    fn from(err: io::Error) -> Self {
        Binlog2SqlError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for Binlog2SqlError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server) => Binlog2SqlError::QueryError {
                code: server.code,
                message: server.message,
            },
            mysql_async::Error::Io(io) => Binlog2SqlError::QueryError {
                code: CR_SERVER_LOST,
                message: io.to_string(),
            },
            mysql_async::Error::Driver(
                driver @ (DriverError::ConnectionClosed | DriverError::PoolDisconnected),
            ) => Binlog2SqlError::QueryError {
                code: CR_SERVER_GONE_ERROR,
                message: driver.to_string(),
            },
            mysql_async::Error::Driver(driver) => Binlog2SqlError::Other(driver.to_string()),
            other => Binlog2SqlError::ConnectionError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Binlog2SqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        let lost = Binlog2SqlError::QueryError {
            code: CR_SERVER_LOST,
            message: "Lost connection".to_string(),
        };
        let gone = Binlog2SqlError::QueryError {
            code: CR_SERVER_GONE_ERROR,
            message: "gone away".to_string(),
        };
        let syntax = Binlog2SqlError::QueryError {
            code: 1064,
            message: "syntax".to_string(),
        };
        assert!(lost.is_transient());
        assert!(gone.is_transient());
        assert!(!syntax.is_transient());
        assert!(!Binlog2SqlError::IncompatibleOptions("x".into()).is_transient());
    }

    #[test]
    fn test_driver_errors() {
        let closed: Binlog2SqlError = mysql_async::Error::Driver(DriverError::ConnectionClosed).into();
        assert!(closed.is_transient());

        let mismatch: Binlog2SqlError = mysql_async::Error::Driver(DriverError::StmtParamsMismatch {
            required: 2,
            supplied: 1,
        })
        .into();
        assert!(!mismatch.is_transient());

        let io: Binlog2SqlError = mysql_async::Error::Io(mysql_async::IoError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        )))
        .into();
        assert!(io.is_transient());

        let refused = Binlog2SqlError::ConnectionError("Failed to connect to MySQL".to_string());
        assert!(!refused.is_transient());
    }

    #[test]
    fn test_positional_messages() {
        let err = Binlog2SqlError::malformed(4, "bad magic");
        assert_eq!(err.to_string(), "malformed binlog at position 4: bad magic");
    }
}
