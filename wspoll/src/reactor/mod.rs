//! One-shot readiness notifications.
//!
//! The poller watches sockets for read readiness and reports at most one event per
//! registration until that registration is explicitly resumed.

mod desc;
mod poller;

pub use desc::{Desc, DescState, Event};
pub use poller::{EventCallback, Poller};
