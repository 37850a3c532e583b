pub mod analyzer;
pub mod eta;
pub mod overrides;
pub mod sink;
