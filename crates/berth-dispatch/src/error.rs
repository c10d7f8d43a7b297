use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("dispatch queue is closed")]
    Closed,

    #[error("worker pool needs at least one worker")]
    NoWorkers,
}

pub type DispatchResult<T> = Result<T, DispatchError>;
