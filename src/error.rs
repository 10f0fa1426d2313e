//! Error types for parsekit
//!
//! This module provides the error type hierarchy used across all components,
//! built with `thiserror`. Each pipeline stage owns a dedicated enum that is
//! folded into the top-level [`Error`].

use thiserror::Error;

/// The main error type for parsekit operations
#[derive(Error, Debug)]
pub enum Error {
    /// CDP transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reasoning-agent boundary errors
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Selector synthesis errors
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Extraction-routine synthesis errors
    #[error("Codegen error: {0}")]
    Codegen(#[from] CodegenError),

    /// Run-time extraction errors
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Parser registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// CDP session and wire-protocol errors.
///
/// All variants are fatal to the current session; the caller must
/// re-establish explicitly.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Command timed out waiting for its response
    #[error("Command '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// CDP method name
        method: String,
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// The WebSocket connection dropped; all pending commands are resolved
    /// with this error
    #[error("Browser connection lost")]
    ConnectionLost,

    /// Response could not be correlated to a request, or was structurally
    /// invalid (unknown id, duplicate id, non-JSON frame)
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The browser reported a command-level error object
    #[error("Command '{method}' failed: {message}")]
    Command {
        /// CDP method name
        method: String,
        /// Error message from the browser
        message: String,
    },

    /// Failed to connect to the browser's debug endpoint
    #[error("Failed to connect to browser: {0}")]
    ConnectFailed(String),

    /// No attachable page target was found
    #[error("No page target available")]
    NoPageTarget,
}

/// Reasoning-collaborator boundary errors
#[derive(Error, Debug)]
pub enum AgentError {
    /// The agent endpoint could not be reached
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    /// The agent returned something that does not parse into an action
    #[error("Unparsable agent action: {0}")]
    UnparsableAction(String),
}

/// Selector synthesis (selection loop) errors
#[derive(Error, Debug)]
pub enum SelectionError {
    /// `finalize` was called with a selector matching zero nodes
    #[error("Selector '{0}' matches no nodes")]
    ZeroMatch(String),

    /// The selector string itself failed to parse
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// Iteration or history budget exceeded without finalizing
    #[error("Selection budget exhausted after {iterations} iterations")]
    Exhausted {
        /// Iterations executed before giving up
        iterations: u32,
    },

    /// The reasoning agent kept failing past the retry cap
    #[error("Agent failed after {attempts} attempts: {last_error}")]
    AgentFailed {
        /// Total attempts made
        attempts: u32,
        /// The final agent error
        last_error: String,
    },

    /// A locator did not resolve to a node in the current snapshot
    #[error("Unknown node locator: {0}")]
    UnknownLocator(String),
}

/// Extraction-routine synthesis (codegen loop) errors
#[derive(Error, Debug)]
pub enum CodegenError {
    /// No candidate routine passed the self-test within the retry cap
    #[error("No valid extraction output after {attempts} attempts: {feedback}")]
    NoValidOutput {
        /// Total attempts made
        attempts: u32,
        /// Feedback from the last failed self-test
        feedback: String,
    },

    /// The agent kept failing past the retry cap
    #[error("Agent failed during codegen: {0}")]
    AgentFailed(String),
}

/// Per-node run-time extraction errors.
///
/// These are caught per matched node; a `parse` call never propagates them.
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// A field rule's selector failed to parse
    #[error("Invalid field selector '{selector}' for field '{field}'")]
    InvalidFieldSelector {
        /// Output field name
        field: String,
        /// The offending selector
        selector: String,
    },

    /// A node's HTML fragment could not be processed
    #[error("Failed to process node fragment: {0}")]
    FragmentFailed(String),
}

/// Parser registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A persisted definition file could not be read or parsed; it is
    /// skipped, never fatal to other domains
    #[error("Corrupt parser definition at {path}: {message}")]
    CorruptDefinition {
        /// File path of the bad definition
        path: String,
        /// Underlying parse/read error
        message: String,
    },

    /// The definition being registered is structurally invalid
    #[error("Invalid parser definition: {0}")]
    InvalidDefinition(String),

    /// Failed to persist a definition
    #[error("Failed to persist definition for '{domain}': {message}")]
    PersistFailed {
        /// Domain key being written
        domain: String,
        /// Underlying I/O error
        message: String,
    },
}

/// Result type alias for parsekit operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }
}
