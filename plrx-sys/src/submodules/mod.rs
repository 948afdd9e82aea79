pub mod backend;
pub mod error;
pub mod handle;
pub mod window;
