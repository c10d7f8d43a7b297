use berth_dispatch::DispatchError;
use berth_pool::PoolError;
use berth_state::{InstanceState, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("host pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("blueprint not found: {0}")]
    BlueprintNotFound(String),

    #[error("blueprint {0} is disabled")]
    BlueprintDisabled(String),

    #[error("blueprint {blueprint} uses driver {driver:?}, which is not enabled")]
    DriverNotEnabled { blueprint: String, driver: String },

    #[error("pool-based drivers are enabled but no host provider is configured")]
    NoHostProvider,

    #[error("cannot {action} instance {id} while it is {state}")]
    InvalidState {
        id: String,
        state: InstanceState,
        action: &'static str,
    },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
