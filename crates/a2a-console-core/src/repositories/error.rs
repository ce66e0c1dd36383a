use thiserror::Error;

/// Failures talking to the remote document store
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// HTTP 503: the persistence backend is down or not configured
    #[error("Storage unavailable: conversation history cannot be reached right now")]
    Unavailable,

    /// HTTP 401
    #[error("Please sign in to save and load conversations")]
    Unauthorized,

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Unexpected response status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid data: {message}")]
    InvalidData { message: String },
}

impl RepositoryError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, resource: &str, body: String) -> Self {
        match status {
            401 => Self::Unauthorized,
            404 => Self::NotFound {
                resource: resource.to_string(),
            },
            503 => Self::Unavailable,
            _ => Self::Status { status, body },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RepositoryError::from_status(503, "x", String::new()).is_unavailable());
        assert!(RepositoryError::from_status(401, "x", String::new()).is_unauthorized());
        assert!(RepositoryError::from_status(404, "conversation c1", String::new()).is_not_found());
        assert!(matches!(
            RepositoryError::from_status(500, "x", "boom".into()),
            RepositoryError::Status { status: 500, .. }
        ));
    }

    #[test]
    fn test_user_facing_messages() {
        assert!(RepositoryError::Unauthorized.to_string().contains("sign in"));
        assert!(RepositoryError::Unavailable.to_string().starts_with("Storage unavailable"));
    }
}
