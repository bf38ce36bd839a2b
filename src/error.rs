//! Crate-wide error type.
//!
//! Hand-rolled enum + `Display` + `std::error::Error`, matching the
//! teacher's own `SongWalkerError`/`LexError`/`ParseError` pattern rather
//! than pulling in a derive-macro error crate.

use std::fmt;

/// Error kinds produced by the registry, compiler, and engine.
///
/// Variants map 1:1 to the error kinds of .
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A cell's `language_id` (or the song default) is not registered.
    UnknownLanguage { language_id: String },
    /// The resolved plugin lacks the `Evaluate` capability.
    CannotEvaluate { language_id: String },
    /// `validate()` returned `false`, or a plugin's parser rejected an expression.
    SyntaxError {
        message: String,
        position: Option<usize>,
    },
    /// An FX entry names a transform no registered plugin supplies.
    UnknownTransform { name: String },
    /// A transform rejected its params string at parse time.
    BadTransformParams { name: String, message: String },
    /// Any allocation failed (surfaced only where calls for it).
    OutOfMemory,
    /// The pending-event priority queue overflowed; the newest event was dropped.
    QueueFull,
    /// The plugin registry is at capacity.
    RegistryFull,
    /// `register()` was called twice with the same `language_id`.
    DuplicateLanguage { language_id: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::UnknownLanguage { language_id } => {
                write!(f, "unknown language '{language_id}'")
            }
            CoreError::CannotEvaluate { language_id } => {
                write!(f, "plugin '{language_id}' cannot evaluate (no Evaluate capability)")
            }
            CoreError::SyntaxError { message, position } => match position {
                Some(pos) => write!(f, "syntax error at {pos}: {message}"),
                None => write!(f, "syntax error: {message}"),
            },
            CoreError::UnknownTransform { name } => write!(f, "unknown transform '{name}'"),
            CoreError::BadTransformParams { name, message } => {
                write!(f, "bad params for transform '{name}': {message}")
            }
            CoreError::OutOfMemory => write!(f, "out of memory"),
            CoreError::QueueFull => write!(f, "pending event queue is full"),
            CoreError::RegistryFull => write!(f, "plugin registry is full"),
            CoreError::DuplicateLanguage { language_id } => {
                write!(f, "language '{language_id}' is already registered")
            }
        }
    }
}

impl std::error::Error for CoreError {}

/// A compile/evaluation error tagged with the (pattern, track, row) that
/// produced it. The engine attaches location at the call site so
/// `CoreError` itself stays reusable from contexts with no grid position
/// (e.g. `eval_immediate`).
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedError {
    pub error: CoreError,
    pub pattern: usize,
    pub track: usize,
    pub row: usize,
}

impl fmt::Display for LocatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[pattern {}, track {}, row {}] {}",
            self.pattern, self.track, self.row, self.error
        )
    }
}

impl std::error::Error for LocatedError {}
