use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown aggregation mode: {0}")]
    UnknownAggregationMode(i64),
}
