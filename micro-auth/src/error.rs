/// Token validation failures. All of them surface as 401 at the boundary;
/// the distinction is for logs.
#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidAuthScheme,
    InvalidToken(String),
    TokenExpired,
    ValidationFailed(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "missing bearer token"),
            AuthError::InvalidAuthScheme => write!(f, "invalid authorization scheme"),
            AuthError::InvalidToken(msg) => write!(f, "invalid token: {msg}"),
            AuthError::TokenExpired => write!(f, "token expired"),
            AuthError::ValidationFailed(msg) => write!(f, "token validation failed: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl AuthError {
    /// What callers get to see. Details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        "Unauthorized"
    }
}
