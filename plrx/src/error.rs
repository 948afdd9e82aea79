//! Errors raised by the bridge.
use crate::sys::{NativeError, NativeHandle};
use core::fmt;

/// Errors returned by hooks that user code supplies (pool hooks, listeners).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = BridgeError> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A `DualState` was used after its lifespan ended or after it was
    /// released. Stop using the handle.
    #[error("native handle {handle} is stale: its lifespan has ended or it was released")]
    Stale { handle: NativeHandle },

    /// A programming defect in the calling code.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// A call into the engine was attempted while an earlier engine error was
    /// still unresolved.
    #[error("an earlier error from the engine was caught but not resolved")]
    Unhandled {
        #[source]
        cause: NativeError,
    },

    #[error(transparent)]
    Native(#[from] NativeError),

    /// A pooled instance's activation or passivation hook failed. The instance
    /// has been discarded.
    #[error("discarded pooled `{type_name}`: {phase} failed")]
    Teardown {
        type_name: &'static str,
        phase: PoolPhase,
        #[source]
        source: BoxError,
    },

    #[error("could not construct pooled `{type_name}`")]
    Construct {
        type_name: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("listener failed while handling {event}")]
    Listener {
        event: String,
        #[source]
        source: BoxError,
    },

    #[error("work handed to the native thread panicked")]
    HandOffPanicked,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Staleness and unresolved engine errors are ordinary, recoverable
    /// outcomes; usage errors are defects.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BridgeError::Usage(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("the bridge was used from a thread that is not the native-capable thread")]
    NotNativeThread,
    #[error("the bridge is already initialized on this thread")]
    AlreadyInitialized,
    #[error("invocation at nesting level {level} was requested while that level is exiting")]
    ReentrantExit { level: u32 },
    #[error("savepoint is already established")]
    AlreadyEstablished,
    #[error("savepoint has not been established")]
    NotEstablished,
    #[error("another savepoint is already being established")]
    NurseryOccupied,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolPhase {
    Activation,
    Passivation,
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolPhase::Activation => "activation",
            PoolPhase::Passivation => "passivation",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for setting \"{name}\": expected a boolean")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}
