use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("executor {0} is already parked")]
    AlreadyParked(u64),

    #[error("job offer for executor {0} already carries a work unit")]
    OfferAlreadyTaken(u64),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ConveyorError>;
