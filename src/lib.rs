pub mod config;
pub mod destructor;
pub mod error;
pub mod install;
pub mod logging;
pub mod network;
pub mod paths;
pub mod platform;
pub mod qemu;
pub mod utils;

// Re-export core types for convenience
pub use destructor::{Destroy, DestructorChain};
pub use error::Error;
pub use platform::{Flight, Machine};
