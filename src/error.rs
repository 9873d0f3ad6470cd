use std::fmt;
use std::io;

/// Failure to parse textual IP address input for an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAddress {
    text: String,
}

impl InvalidAddress {
    pub(crate) fn new(text: impl Into<String>) -> InvalidAddress {
        InvalidAddress { text: text.into() }
    }
}

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address: {:?}", self.text)
    }
}

impl std::error::Error for InvalidAddress {}

impl From<InvalidAddress> for io::Error {
    fn from(err: InvalidAddress) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// Returns the last OS error, the way every syscall wrapper in this crate reports failure.
pub(crate) fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

/// A malformed or unrecognized line in a [`crate::config::Config`] file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> ConfigError {
        ConfigError { message: message.into() }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for io::Error {
    fn from(err: ConfigError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}
