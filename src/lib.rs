#[cfg(not(unix))]
compile_error!("confd needs unix domain sockets and fcntl locks");

pub mod activation;
pub mod clienv;
pub mod daemon;
pub mod error;
pub mod lock;
pub mod user_config;

pub use activation::Activator;
pub use error::{ConfdError, Result};
pub use lock::{AddressLock, CurrentHolder};
