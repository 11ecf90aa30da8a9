pub mod model;
pub mod package;
pub mod write;
pub mod xml;
