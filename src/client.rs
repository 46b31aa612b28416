//! Bridge entry point for the host.
//!
//! Keep the public surface small: route a request, then serve a `byok` route through
//! the chat or task operations. Implementation details live under `src/client/`.

pub mod builder;
pub mod core;

pub use builder::BridgeBuilder;
pub use core::Bridge;
