use thiserror::Error;

/// Failures surfaced to callers. Most resolver paths degrade to a safe
/// default instead (empty sentinel, not-supported quality); these variants
/// cover the operations that genuinely cannot proceed.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("No definition registered with id '{0}'")]
    UnknownDefinition(String),

    #[error("Machine stack '{0}' failed validation")]
    InvalidStack(String),

    #[error("Stack build error: {0}")]
    Build(String),
}
