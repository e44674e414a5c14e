//! The authentication collaborator: the connection upgrade path only needs
//! an "is this caller authorized" answer, nothing about how tokens are
//! issued or verified beyond that.

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<(), AuthError>;
}

/// Verifies against a single pre-shared token.
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if token != self.token {
            return Err(AuthError::InvalidToken);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_accept_the_configured_token_only() {
        let verifier = StaticTokenVerifier::new("hunter2");
        assert!(verifier.verify("hunter2").is_ok());
        assert!(matches!(
            verifier.verify("hunter3"),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            verifier.verify(""),
            Err(AuthError::MissingToken)
        ));
    }
}
