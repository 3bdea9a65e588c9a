use thiserror::Error;

/// Error classification consumed by the message runtime.
///
/// Handlers map everything they raise into one of these kinds; the runtime
/// decides retry vs dead-letter purely from the kind.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Input cannot be parsed or violates a static invariant. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient I/O failure (broker, analytical store, cache, upstream).
    /// Retried with backoff up to the consumer's retry budget.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Logical impossibility or exhausted invariant. Never retried.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Surfaced by the runtime after the retry budget is spent.
    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl ConsumerError {
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        ConsumerError::Retryable(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        ConsumerError::Fatal(err.to_string())
    }

    /// Whether the runtime may re-deliver the message to the handler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumerError::Retryable(_))
    }
}

/// Errors raised by the backtest simulator itself.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Wall-clock guard tripped inside the candle loop. Retryable once.
    #[error(
        "simulation timeout after {elapsed_secs:.1}s: processed {processed}/{total} candles"
    )]
    Timeout {
        elapsed_secs: f64,
        processed: usize,
        total: usize,
    },

    /// Simulation input violates an invariant (empty frame, bad window).
    #[error("invalid simulation input: {0}")]
    InvalidInput(String),
}

/// Errors raised while validating or evaluating a strategy definition.
#[derive(Debug, Error, PartialEq)]
pub enum StrategyError {
    #[error("strategy has neither entry_buy_conditions nor entry_sell_conditions")]
    MissingEntryConditions,

    #[error("stop loss percentage must be in (0, 50], got {0}")]
    InvalidStopLossPercentage(f64),

    #[error("take profit percentage must be in (0, 100], got {0}")]
    InvalidTakeProfitPercentage(f64),

    #[error("risk/reward ratio must be positive, got {0}")]
    InvalidRiskRewardRatio(f64),

    #[error("cannot parse indicator key '{0}'")]
    MalformedIndicatorKey(String),

    #[error("unknown column '{0}' referenced by strategy")]
    UnknownColumn(String),

    #[error("{0} is position-aware and only valid inside exit conditions")]
    FlipNodeInEntry(&'static str),
}
