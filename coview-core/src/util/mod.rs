mod id;
mod introspection;

pub use id::*;
pub use introspection::*;
