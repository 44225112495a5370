use std::io::Error as IoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("upstream response error: {0}")]
    UpstreamResponse(String),

    #[error("header parse error: {0}")]
    HeaderParse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("mount registry error: {0}")]
    MountRegistry(String),

    #[error("master fetch error: {0}")]
    MasterFetch(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    pub fn connect(msg: impl Into<String>) -> Self {
        Error::Connect(msg.into())
    }

    pub fn upstream_response(msg: impl Into<String>) -> Self {
        Error::UpstreamResponse(msg.into())
    }

    pub fn header_parse(msg: impl Into<String>) -> Self {
        Error::HeaderParse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn mount_registry(msg: impl Into<String>) -> Self {
        Error::MountRegistry(msg.into())
    }

    pub fn master_fetch(msg: impl Into<String>) -> Self {
        Error::MasterFetch(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::connect("timed out");
        assert_eq!(format!("{}", err), "connect error: timed out");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = IoError::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        matches!(err, Error::Io(_));
    }
}
