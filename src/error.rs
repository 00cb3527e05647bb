//! Errors raised by the Hafnium scheduling core

/// An error from the scheduling core
#[derive(Debug)]
pub enum Error {
    /// A malformed or inconsistent configuration was rejected
    Config(String),
    /// An RM request failed validation
    Validation(String),
    /// An allocation would push a queue over its maximum resource
    Capacity(String),
    /// An operation required an object that does not exist
    NotFound(String),
    /// A mutation was requested while the target cannot accept it
    State(String),
    /// An accounting update would violate a core invariant
    Invariant(String),
    /// A generic error with a message
    Generic(String),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the error message for this error
    pub fn msg(&self) -> &str {
        match self {
            Error::Config(msg)
            | Error::Validation(msg)
            | Error::Capacity(msg)
            | Error::NotFound(msg)
            | Error::State(msg)
            | Error::Invariant(msg)
            | Error::Generic(msg) => msg,
        }
    }

    /// Get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "Config",
            Error::Validation(_) => "Validation",
            Error::Capacity(_) => "Capacity",
            Error::NotFound(_) => "NotFound",
            Error::State(_) => "State",
            Error::Invariant(_) => "Invariant",
            Error::Generic(_) => "Generic",
        }
    }
}

impl std::fmt::Display for Error {
    /// Display this error in an easy readable format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.msg())
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Validation(error.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Config(error.to_string())
    }
}
