//! Protocol constants

/// Size of the big-endian length prefix.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// `type:u8` + `serialNumber:u64` + `uriLength:u8`
pub const HEADER_SIZE: usize = 1 + 8 + 1;

/// Longest uri a frame can carry (the length field is a single byte).
pub const MAX_URI_LEN: usize = u8::MAX as usize;

/// Maximum declared frame length accepted by a client (1 MiB).
pub const CLIENT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum declared frame length accepted by the relay (2 MiB).
pub const RELAY_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Separator between the user id and the client key in a tunnel CONNECT uri.
pub const URI_SEPARATOR: char = '@';
