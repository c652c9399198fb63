//! Unified authorization error model and mapping helpers.
//! Every failure the pipeline can produce is call-scoped and terminal for that call.
//! Callers use [`AuthzError::code`] to tell an ordinary denial apart from
//! misconfiguration (compile/evaluation errors) and map either onto their transport.

use thiserror::Error;

/// Transport-neutral status classification (gRPC code names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    PermissionDenied,
    Unauthenticated,
    Internal,
    DeadlineExceeded,
    FailedPrecondition,
    Unavailable,
}

impl Code {
    /// Numeric gRPC status code.
    pub fn grpc_code(self) -> i32 {
        match self {
            Code::DeadlineExceeded => 4,
            Code::PermissionDenied => 7,
            Code::FailedPrecondition => 9,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::Unauthenticated => 16,
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Code::PermissionDenied => 403,
            Code::Unauthenticated => 401,
            Code::Internal | Code::FailedPrecondition => 500,
            Code::DeadlineExceeded => 504,
            Code::Unavailable => 503,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthzError {
    /// The identity collaborator failed; nothing was evaluated.
    #[error("authorizer: failed to extract user: {0}")]
    Identity(String),

    #[error("authorizer: failed to compile expression '{expression}': {message}")]
    Compile { expression: String, message: String },

    #[error("authorizer: failed to run expression '{expression}': {message}")]
    Evaluation { expression: String, message: String },

    #[error("authorizer: expression '{expression}' did not return a boolean, got {got}")]
    NonBoolean { expression: String, got: String },

    #[error("authorizer: deadline exceeded while evaluating '{expression}'")]
    DeadlineExceeded { expression: String },

    #[error("authorizer: permission denied for {method}")]
    PermissionDenied { method: String },

    #[error("authorizer: invalid rule catalog: {0}")]
    Catalog(String),

    #[error("authorizer: invalid configuration: {0}")]
    Config(String),

    /// No interpreter instance became available before the call deadline.
    #[error("authorizer: evaluator pool exhausted: {0}")]
    Pool(String),
}

pub type AuthzResult<T> = Result<T, AuthzError>;

impl AuthzError {
    pub fn compile(expression: &str, message: impl ToString) -> Self {
        AuthzError::Compile { expression: expression.to_string(), message: message.to_string() }
    }

    pub fn evaluation(expression: &str, message: impl ToString) -> Self {
        AuthzError::Evaluation { expression: expression.to_string(), message: message.to_string() }
    }

    pub fn denied(method: &str) -> Self {
        AuthzError::PermissionDenied { method: method.to_string() }
    }

    /// Stable snake_case code for logs and response bodies.
    pub fn code_str(&self) -> &'static str {
        match self {
            AuthzError::Identity(_) => "identity_error",
            AuthzError::Compile { .. } => "compile_error",
            AuthzError::Evaluation { .. } => "evaluation_error",
            AuthzError::NonBoolean { .. } => "non_boolean_result",
            AuthzError::DeadlineExceeded { .. } => "deadline_exceeded",
            AuthzError::PermissionDenied { .. } => "permission_denied",
            AuthzError::Catalog(_) => "catalog_error",
            AuthzError::Config(_) => "config_error",
            AuthzError::Pool(_) => "pool_exhausted",
        }
    }

    pub fn code(&self) -> Code {
        match self {
            AuthzError::PermissionDenied { .. } => Code::PermissionDenied,
            AuthzError::Identity(_) => Code::Unauthenticated,
            AuthzError::Compile { .. }
            | AuthzError::Evaluation { .. }
            | AuthzError::NonBoolean { .. } => Code::Internal,
            AuthzError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            AuthzError::Catalog(_) | AuthzError::Config(_) => Code::FailedPrecondition,
            AuthzError::Pool(_) => Code::Unavailable,
        }
    }

    /// True for traffic-driven denials, false for errors an operator must look at.
    pub fn is_denial(&self) -> bool {
        matches!(self, AuthzError::PermissionDenied { .. })
    }

    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    pub fn grpc_code(&self) -> i32 {
        self.code().grpc_code()
    }
}

impl From<anyhow::Error> for AuthzError {
    fn from(err: anyhow::Error) -> Self {
        // Extractors are the only collaborators returning anyhow errors
        AuthzError::Identity(format!("{:#}", err))
    }
}
