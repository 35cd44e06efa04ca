mod clock_engine;

pub use clock_engine::*;
