pub mod clock;
pub mod file_helpers;

pub use clock::*;
pub use file_helpers::*;
