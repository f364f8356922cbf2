// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;

/// An error reported by a connection while carrying out an RPC: a reset
/// connection, a remote error, or a protocol violation. Remote errors may
/// wrap the error that caused them.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportError {
    pub name: String,
    pub message: String,
    pub cause: Option<Box<TransportError>>,
}

impl TransportError {
    pub fn new<N, M>(name: N, message: M) -> Self
    where
        N: Into<String>,
        M: Into<String>,
    {
        TransportError {
            name: name.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: TransportError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The innermost error in the cause chain.
    pub fn root_cause(&self) -> &TransportError {
        let mut err = self;
        while let Some(cause) = &err.cause {
            err = cause;
        }
        err
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}: {}", self.name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(fmt, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn StdError + 'static))
    }
}

/// The number of response messages an RPC was expected to produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    ExactlyOne,
    AtMostOne,
}

impl fmt::Display for ResponseShape {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseShape::ExactlyOne => fmt.write_str("exactly one"),
            ResponseShape::AtMostOne => fmt.write_str("at most one"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// Neither an available connection nor a usable fallback connection
    /// exists.
    NoBackendsAvailable,
    /// The client has been closed.
    ClientClosed,
    /// The underlying RPC failed.
    Transport(TransportError),
    /// The remote end returned the wrong number of messages.
    ResponseShape {
        method: String,
        expected: ResponseShape,
        received: usize,
    },
    /// An RPC argument or response could not be converted to or from JSON.
    Serialization(serde_json::Error),
    /// The connection set could not locate or connect to backends.
    ConnectionSet(String),
}

impl Error {
    /// Whether this is one of the transient conditions the caller may retry
    /// after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NoBackendsAvailable | Error::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Error::Transport(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoBackendsAvailable => {
                fmt.write_str("no backends available")
            }
            Error::ClientClosed => fmt.write_str("client is closed"),
            Error::Transport(err) => write!(fmt, "{}", err),
            Error::ResponseShape {
                method,
                expected,
                received,
            } => write!(
                fmt,
                "{}: expected {} response message(s), received {}",
                method, expected, received
            ),
            Error::Serialization(err) => write!(fmt, "{}", err),
            Error::ConnectionSet(msg) => {
                write!(fmt, "connection set error: {}", msg)
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            Error::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_walks_chain() {
        let err = TransportError::new("RequestError", "request failed")
            .with_cause(
                TransportError::new("ServerError", "server error")
                    .with_cause(TransportError::new(
                        "ObjectNotFoundError",
                        "no such key",
                    )),
            );

        assert_eq!(err.root_cause().name, "ObjectNotFoundError");
        assert_eq!(
            err.to_string(),
            "RequestError: request failed: ServerError: server \
             error: ObjectNotFoundError: no such key"
        );

        let plain = TransportError::new("Reset", "connection reset");
        assert_eq!(plain.root_cause(), &plain);
    }

    #[test]
    fn shape_error_display() {
        let err = Error::ResponseShape {
            method: String::from("getObject"),
            expected: ResponseShape::ExactlyOne,
            received: 2,
        };
        assert_eq!(
            err.to_string(),
            "getObject: expected exactly one response message(s), received 2"
        );
        assert!(!err.is_retryable());
        assert!(Error::NoBackendsAvailable.is_retryable());
    }
}
