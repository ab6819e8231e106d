use std::collections::HashMap;

/// Semantic error raised by handlers and middleware.
///
/// The variant determines the HTTP-style status code and the stable `type`
/// identifier written into response bodies. Every user-visible body carries
/// `error` (human message) and `type`; `Validation` and `RateLimit` add
/// their extra fields.
pub enum MicroError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Validation {
        message: String,
        errors: HashMap<String, Vec<String>>,
    },
    RateLimit {
        message: String,
        retry_after: u64,
    },
    ServiceUnavailable(String),
    Timeout(String),
    Internal(String),
}

impl MicroError {
    /// HTTP-style status code for this error, used on every transport.
    pub fn status(&self) -> u16 {
        match self {
            MicroError::BadRequest(_) => 400,
            MicroError::Unauthorized(_) => 401,
            MicroError::Forbidden(_) => 403,
            MicroError::NotFound(_) => 404,
            MicroError::Conflict(_) => 409,
            MicroError::Validation { .. } => 422,
            MicroError::RateLimit { .. } => 429,
            MicroError::ServiceUnavailable(_) => 503,
            MicroError::Timeout(_) => 504,
            MicroError::Internal(_) => 500,
        }
    }

    /// Stable identifier written as the `type` field of error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            MicroError::BadRequest(_) => "BadRequestError",
            MicroError::Unauthorized(_) => "UnauthorizedError",
            MicroError::Forbidden(_) => "ForbiddenError",
            MicroError::NotFound(_) => "NotFoundError",
            MicroError::Conflict(_) => "ConflictError",
            MicroError::Validation { .. } => "ValidationError",
            MicroError::RateLimit { .. } => "RateLimitError",
            MicroError::ServiceUnavailable(_) => "ServiceUnavailableError",
            MicroError::Timeout(_) => "TimeoutError",
            MicroError::Internal(_) => "InternalError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            MicroError::BadRequest(msg)
            | MicroError::Unauthorized(msg)
            | MicroError::Forbidden(msg)
            | MicroError::NotFound(msg)
            | MicroError::Conflict(msg)
            | MicroError::ServiceUnavailable(msg)
            | MicroError::Timeout(msg)
            | MicroError::Internal(msg) => msg,
            MicroError::Validation { message, .. } => message,
            MicroError::RateLimit { message, .. } => message,
        }
    }

    /// JSON body for this error.
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.message(),
            "type": self.kind(),
        });
        match self {
            MicroError::Validation { errors, .. } => {
                body["validation_errors"] = serde_json::json!(errors);
            }
            MicroError::RateLimit { retry_after, .. } => {
                body["retry_after"] = serde_json::json!(retry_after);
            }
            _ => {}
        }
        body
    }

    /// Rebuild an error from a status code and message, for responses that
    /// crossed a transport boundary.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => MicroError::BadRequest(message),
            401 => MicroError::Unauthorized(message),
            403 => MicroError::Forbidden(message),
            404 => MicroError::NotFound(message),
            409 => MicroError::Conflict(message),
            422 => MicroError::Validation {
                message,
                errors: HashMap::new(),
            },
            429 => MicroError::RateLimit {
                message,
                retry_after: 0,
            },
            503 => MicroError::ServiceUnavailable(message),
            504 => MicroError::Timeout(message),
            _ => MicroError::Internal(message),
        }
    }
}

impl std::fmt::Display for MicroError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::fmt::Debug for MicroError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for MicroError {}

impl From<std::io::Error> for MicroError {
    fn from(err: std::io::Error) -> Self {
        MicroError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for MicroError {
    fn from(err: serde_json::Error) -> Self {
        MicroError::BadRequest(err.to_string())
    }
}
