mod engines;

pub use engines::*;
