pub mod agent;
pub mod competition;
pub mod knowledge;
pub mod market;
pub mod memory;
pub mod pattern;

pub use agent::*;
pub use competition::*;
pub use knowledge::*;
pub use market::*;
pub use memory::*;
pub use pattern::*;
