use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),
    #[error("json Error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("yaml Error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("toml Error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("tls Error: {0}")]
    TlsError(#[from] rustls::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("secret {namespace}/{name}: {reason}")]
    SecretMaterial {
        namespace: String,
        name: String,
        reason: String,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("login rejected by server: {0}")]
    LoginRejected(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("{0}")]
    Aggregate(Aggregate),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 404)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Collapses a list of errors: `Ok` when empty, the sole error when there
    /// is one, otherwise an aggregate.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(Aggregate(errors))),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(err.to_string())
    }
}

#[derive(Debug)]
pub struct Aggregate(pub Vec<Error>);

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{err}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "NotFound".to_string(),
            code,
        }))
    }

    #[test]
    fn not_found_is_detected() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::ChannelClosed.is_not_found());
    }

    #[test]
    fn aggregate_collapses() {
        assert!(Error::aggregate(vec![]).is_ok());
        assert!(matches!(
            Error::aggregate(vec![Error::ChannelClosed]),
            Err(Error::ChannelClosed)
        ));
        let err = Error::aggregate(vec![
            Error::Protocol("a".to_string()),
            Error::Protocol("b".to_string()),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "[protocol error: a, protocol error: b]");
    }
}
