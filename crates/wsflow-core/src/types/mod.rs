//! Core data types: stream/task state enums and stream identity.

pub mod enums;
pub mod symbol;

pub use enums::*;
pub use symbol::*;
