//! Session transport abstractions for the DMS lite system.
//!
//! The real device-to-device session substrate lives outside this workspace.
//! This crate defines the adapter surface the scheduler drives and the
//! callback surface the substrate invokes, plus in-process transports used by
//! tests and the demo binary.

pub mod traits;
pub mod testing;
pub mod loopback;

pub use traits::*;
pub use testing::*;
pub use loopback::*;
