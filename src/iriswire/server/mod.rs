mod listener;
pub mod registry;
mod service;
pub mod transport;

pub use listener::Listener;
pub use registry::{CancelRegistry, CancelToken};
pub use service::{HostServices, Server};
pub use transport::{BoxedStream, Stream};
