// Core kernel library

pub mod error;
pub mod panic;

pub use error::{Errno, KernelError, Result};
