//! `LanBridge` wire protocol
//!
//! Every message exchanged between a relay and a client, on both the
//! control channel and the tunnel connections, is a length-prefixed
//! [`Frame`] encoded by [`ProxyCodec`].

pub mod codec;
pub mod constants;
pub mod frame;

pub use codec::{CodecError, ProxyCodec};
pub use frame::{Frame, FrameType};
