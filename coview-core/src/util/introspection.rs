use std::fmt::Debug;

/// Returns a plain snapshot of a component's internal state, for logs and tests.
pub trait Introspect<T>
where
    T: Debug,
{
    fn introspect(&self) -> T;
}
