#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    //config error: a policy failed validation at construction
    #[error("invalid quota policy: {0}")]
    InvalidPolicy(String),
}

// result type alias for convenience
pub type Result<T> = std::result::Result<T, QuotaError>;
