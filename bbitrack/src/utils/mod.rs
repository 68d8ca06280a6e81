pub mod file;
#[cfg(feature = "read")]
pub mod misc;

#[cfg(feature = "cli")]
pub mod cli;

pub use file::*;
