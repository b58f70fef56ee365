//! Error types for flow compilation.

use thiserror::Error;

/// Main error type for compiling a flow into a network.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("malformed flow: {reason}")]
    MalformedFlow { reason: String },

    #[error("no kernel supports step '{step}' of type {op}")]
    NoKernel { step: String, op: String },

    #[error("conflicting element order for tensor '{tensor}'")]
    ConflictingOrder { tensor: String },

    #[error("tensor '{tensor}' ({tensor_type}) incompatible with linked tensor '{link}' ({link_type})")]
    IncompatibleLink {
        tensor: String,
        tensor_type: String,
        link: String,
        link_type: String,
    },

    #[error("register overflow in step '{step}'")]
    RegisterOverflow { step: String },

    #[error("expression syntax error: {message}")]
    ExpressionSyntax { message: String },

    #[error("no expression generator for step '{step}': {reason}")]
    UnsupportedExpression { step: String, reason: String },

    #[error("transformer pipeline did not converge after {passes} passes")]
    TransformDivergence { passes: usize },

    #[error("instruction encoding failed: {0}")]
    Encoding(String),

    #[error("memory allocation failed: {reason}")]
    Allocation { reason: String },
}

impl From<iced_x86::IcedError> for CompileError {
    fn from(err: iced_x86::IcedError) -> Self {
        CompileError::Encoding(err.to_string())
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
