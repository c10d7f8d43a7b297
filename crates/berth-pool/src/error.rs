use berth_core::SizeClass;
use berth_driver::DriverError;
use berth_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("host provider error: {0}")]
    Provider(#[from] DriverError),

    #[error("no flavor provides {0} slots")]
    NoFlavor(SizeClass),
}

pub type PoolResult<T> = Result<T, PoolError>;
