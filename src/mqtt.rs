mod packet;
mod session;
mod transport;

pub use packet::*;
pub use session::*;
pub use transport::{SUBPROTOCOL, Transport, TransportError, WsTransport};

#[cfg(test)]
pub(crate) use transport::testing;
