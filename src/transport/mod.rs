// Implementations of the persistent connection
pub mod loopback;
pub mod tcp;

pub use loopback::{AckBehavior, LoopbackServer};
pub use tcp::TcpTransport;
