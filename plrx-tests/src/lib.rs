//! Testing support for `plrx`.
//!
//! [`MockEngine`] plays the part of the database engine: it implements
//! [`plrx::sys::Backend`] entirely in memory and drives the bridge through
//! [`plrx::hooks`] the way a real engine would, reentrancy included.
mod framework;

pub use framework::*;

#[cfg(test)]
mod tests;
