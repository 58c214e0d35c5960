// Error types for the reward-points core
use std::fmt;

#[derive(Debug, Clone)]
pub enum RewardError {
    // Validation errors
    InvalidAmount(String),
    InsufficientAvailable { available: u64, requested: u64 },
    RedemptionBelowMinimum { value_cents: u64, min_cents: u64 },
    RedemptionOverCap { points: u64, cap: u64 },

    // Reservation / event-ordering errors
    NoReservationFound { order_ref: String },
    OutOfOrderEvent { order_ref: String, detail: String },

    // Configuration errors
    Config(String),

    // Storage errors
    Storage(String),
}

impl fmt::Display for RewardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount(msg) => write!(f, "Invalid amount: {}", msg),
            Self::InsufficientAvailable { available, requested } => {
                write!(
                    f,
                    "Insufficient available points: have {}, need {}",
                    available, requested
                )
            }
            Self::RedemptionBelowMinimum { value_cents, min_cents } => {
                write!(
                    f,
                    "Redemption value {} below minimum {}",
                    value_cents, min_cents
                )
            }
            Self::RedemptionOverCap { points, cap } => {
                write!(f, "Redemption of {} points exceeds per-order cap {}", points, cap)
            }
            Self::NoReservationFound { order_ref } => {
                write!(f, "No open reservation for order {}", order_ref)
            }
            Self::OutOfOrderEvent { order_ref, detail } => {
                write!(f, "Out-of-order event for order {}: {}", order_ref, detail)
            }
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for RewardError {}

impl From<anyhow::Error> for RewardError {
    fn from(err: anyhow::Error) -> Self {
        RewardError::Storage(err.to_string())
    }
}

// Error code mapping for operation responses
impl RewardError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InsufficientAvailable { .. } => "INSUFFICIENT_AVAILABLE",
            Self::RedemptionBelowMinimum { .. } => "REDEMPTION_BELOW_MINIMUM",
            Self::RedemptionOverCap { .. } => "REDEMPTION_OVER_CAP",
            Self::NoReservationFound { .. } => "NO_RESERVATION_FOUND",
            Self::OutOfOrderEvent { .. } => "OUT_OF_ORDER_EVENT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Storage failures may succeed on redelivery; everything else is
    /// deterministic and must not be retried blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount(_)
                | Self::InsufficientAvailable { .. }
                | Self::RedemptionBelowMinimum { .. }
                | Self::RedemptionOverCap { .. }
        )
    }
}
