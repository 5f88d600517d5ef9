//! Error taxonomy shared by the adapter, engine, and workflow.
//!
//! The Adapter retries [`EngineError::TransientIo`] internally; every other
//! variant is surfaced unchanged to the Workflow, which pattern-matches once
//! at the instrument boundary (see `workflow.rs`). The teacher's tree never
//! defines a typed error enum of its own (it propagates `anyhow::Error`
//! everywhere), so there is no `derive`-macro precedent to follow here;
//! `Display`/`Error` are hand-written in the same plain style the teacher
//! uses for its few manual trait impls.

#[derive(Debug)]
pub enum EngineError {
    Configuration(String),
    Auth {
        operation: &'static str,
        symbol: String,
        message: String,
    },
    TransientIo {
        operation: &'static str,
        symbol: String,
        message: String,
    },
    Validation {
        operation: &'static str,
        symbol: String,
        kind: ValidationKind,
        message: String,
    },
    InsufficientData {
        needed: usize,
        have: usize,
    },
    Cancelled {
        operation: &'static str,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Configuration(message) => write!(f, "configuration error: {message}"),
            EngineError::Auth { operation, symbol, message } => {
                write!(f, "auth rejected on {operation} for {symbol}: {message}")
            }
            EngineError::TransientIo { operation, symbol, message } => {
                write!(f, "transient I/O error on {operation} for {symbol} (exhausted retries): {message}")
            }
            EngineError::Validation { operation, symbol, kind, message } => {
                write!(f, "validation error on {operation} for {symbol}: {kind:?} ({message})")
            }
            EngineError::InsufficientData { needed, have } => {
                write!(f, "insufficient data: need at least {needed} bars, have {have}")
            }
            EngineError::Cancelled { operation } => write!(f, "cancelled: deadline elapsed during {operation}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    InvalidSymbol,
    InvalidQty,
    InvalidPrice,
    InvalidLeverage,
    PriceOutOfBand,
}

impl EngineError {
    /// True when the Adapter's retry wrapper should re-attempt this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientIo { .. })
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            EngineError::Auth { symbol, .. }
            | EngineError::TransientIo { symbol, .. }
            | EngineError::Validation { symbol, .. } => Some(symbol),
            _ => None,
        }
    }
}
