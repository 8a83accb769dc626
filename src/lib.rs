//! AVR in-system programming over FTDI synchronous bit-bang.

pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod handshake;
pub mod pins;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::config::{ExitSpec, SessionConfig};
pub use self::device::{Memory, MemoryKind, Part, PartDB};
pub use self::error::{Error, Result};
pub use self::handshake::HandshakeState;
pub use self::pins::{PinAssignment, SignalMap};
pub use self::protocol::Opcode;
pub use self::session::Session;
pub use self::transport::{FtdiTransport, PortSelector, Transport};
