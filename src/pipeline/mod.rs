mod fill;
pub mod prompt;

pub use fill::{FillPass, FillSummary};
