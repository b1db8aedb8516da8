//! Core data types for the ticker relay.

pub mod pair;
pub mod subscription;
pub mod symbols;
pub mod ticker;

pub use pair::*;
pub use subscription::*;
pub use symbols::*;
pub use ticker::*;
