//! Units of work accepted by the worker pools.

/// A boxed closure run exactly once by a pool worker.
///
/// Tasks carry no identity and return nothing; anything they need, typically a
/// [`Channel`](crate::Channel), is captured by the closure. Error handling lives
/// inside the closure itself.
pub type Task = Box<dyn FnOnce() + Send + 'static>;
