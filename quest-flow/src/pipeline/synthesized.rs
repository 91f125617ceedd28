//! Outcome of a synthesis step that may have fallen back to a deterministic
//! value.

use crate::error::{PipelineError, Result};

#[derive(Debug)]
pub enum Synthesized<T> {
    /// The preferred strategy produced the value
    Primary(T),
    /// The preferred strategy failed with `cause`; `value` came from the fallback
    Fallback { value: T, cause: PipelineError },
}

impl<T> Synthesized<T> {
    /// Keep `result` if it succeeded, otherwise use `fallback()`.
    pub fn or_fallback<F>(result: Result<T>, fallback: F) -> Self
    where
        F: FnOnce() -> T,
    {
        match result {
            Ok(value) => Synthesized::Primary(value),
            Err(cause) => Synthesized::Fallback {
                value: fallback(),
                cause,
            },
        }
    }

    /// Like [`Synthesized::or_fallback`] for a fallback that can fail itself.
    /// The fallback's error is returned; the primary cause is dropped.
    pub fn or_try_fallback<F>(result: Result<T>, fallback: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T>,
    {
        match result {
            Ok(value) => Ok(Synthesized::Primary(value)),
            Err(cause) => Ok(Synthesized::Fallback {
                value: fallback()?,
                cause,
            }),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Synthesized::Primary(value) | Synthesized::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Synthesized::Primary(value) | Synthesized::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Synthesized::Fallback { .. })
    }

    pub fn cause(&self) -> Option<&PipelineError> {
        match self {
            Synthesized::Primary(_) => None,
            Synthesized::Fallback { cause, .. } => Some(cause),
        }
    }
}
