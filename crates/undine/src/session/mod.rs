//! Child process management: pseudo-terminals, supervision, registry, relay.

pub mod child;
pub mod pty;
pub mod registry;
pub mod relay;

pub use child::{Child, ChildOptions, CommandSpec};
pub use registry::Registry;
pub use relay::{Reaped, Relay};
