//! Device-side primitives: the runtime seam, completion events, stream
//! waits, and a host-only simulated device.

pub mod event;
pub mod runtime;
pub mod sim;
pub mod wait;

pub use event::CompletionEvent;
pub use runtime::{DeviceRuntime, HostFlag, StreamId};
pub use sim::SimDevice;
pub use wait::StreamWait;
