pub use crate::dual_state::{DualState, OnRelease, Pinned, ReleaseCause, Released};
pub use crate::error::{BoxError, BridgeError, UsageError};
pub use crate::invocation::Invocation;
pub use crate::lifespan::{Lifespan, NativeScope};
pub use crate::pool::{ObjectPool, PooledObject};
pub use crate::savepoint::Savepoint;
pub use crate::security::SecurityContext;
pub use crate::sys::{NativeError, NativeHandle, NativeRelease, SubXactId};
pub use crate::xact::{SubXactEvent, SubXactListener, XactEvent, XactListener};
