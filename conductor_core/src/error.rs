//! Error types for the conductor core.

use thiserror::Error;

/// Errors surfaced by the core subsystems.
///
/// Note that scenario *parse* errors are not represented here: a malformed
/// scenario line is logged with its source location and dropped, per the
/// error policy of the scenario language. Only failures that must abort an
/// operation become a `CoreError`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Reading a scenario file (or an included file) failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata table could not be serialized or deserialized.
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// The metadata table carries a schema version this build does not know.
    #[error("Unsupported metadata table version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// A peer filter specification could not be parsed.
    #[error("Invalid peer filter '{0}'")]
    FilterSpec(String),

    /// The component loader found a dependency cycle.
    #[error("Dependency cycle among components: {}", names.join(", "))]
    Cycle { names: Vec<String> },

    /// A component activation or finalization hook failed.
    #[error("Component '{name}' failed to {phase}: {reason}")]
    Hook {
        name: String,
        phase: &'static str,
        reason: String,
    },
}

impl CoreError {
    /// Creates a metadata error.
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Creates a hook failure for a component.
    pub fn hook(name: impl Into<String>, phase: &'static str, reason: impl Into<String>) -> Self {
        Self::Hook {
            name: name.into(),
            phase,
            reason: reason.into(),
        }
    }
}
