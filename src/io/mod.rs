//! Socket and buffer primitives the connection core is built on.
//!
//! - **`socket`**: the [`AsyncSocketIo`] abstraction and its TCP adapter
//! - **`buffer`**: pending-output queue and read sizing

pub mod buffer;
pub mod socket;

pub use buffer::OutputBuffer;
pub use socket::{AsyncSocketIo, CloseMode, ReadCompletion, TcpSocket};
