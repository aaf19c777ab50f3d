use thiserror::Error;

/// Failures surfaced by the relay to in-process callers.
///
/// Malformed frames never show up here: they are logged and dropped inside
/// the socket loops. Unknown-path upgrades are answered on the wire with
/// close code 4004 and never reach a caller either.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay could not listen on the requested address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A command needed the agent but no agent is attached.
    #[error("extension not connected")]
    NotConnected,

    /// A relay-initiated command got no response within the deadline.
    #[error("command {method} timed out")]
    CommandTimeout { method: String },

    /// The agent went away while a command was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The agent answered with an error envelope.
    #[error("protocol error {code}: {message}")]
    Remote { code: i64, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display() {
        let err = RelayError::Remote {
            code: -32000,
            message: "no such frame".to_string(),
        };
        assert_eq!(err.to_string(), "protocol error -32000: no such frame");
    }

    #[test]
    fn timeout_names_the_method() {
        let err = RelayError::CommandTimeout {
            method: "Runtime.evaluate".to_string(),
        };
        assert!(err.to_string().contains("Runtime.evaluate"));
    }

    #[test]
    fn bind_error_keeps_source() {
        use std::error::Error as _;
        let err = RelayError::Bind {
            addr: "127.0.0.1:9223".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("127.0.0.1:9223"));
        assert!(err.source().is_some());
    }
}
