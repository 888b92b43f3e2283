//! A multiplexed, framed, rate-controlled duplex connection on top of a single reliable byte
//!  stream (typically TCP).
//!
//! A connection carries an arbitrary number of logically independent *channels*, each identified
//!  by a one-byte id. Callers enqueue whole messages onto a channel; the connection slices them
//!  into packets of at most `max_packet_size` bytes, interleaves packets from all channels by a
//!  weighted-fair priority policy, and writes them through a buffered writer whose flushes are
//!  throttled. The receiving side reassembles packets per channel and dispatches each completed
//!  message through a callback.
//!
//! Wire format: a stream of frames, each starting with a one-byte packet type:
//! ```ascii
//! 0x00  PING                                           (no body)
//! 0x01  PONG                                           (no body)
//! 0x10  MESSAGE  channel_id:u8  eof:u8  byte count (varint)  raw bytes
//! ```
//! `eof == 0x01` marks the last fragment of a message. Ping/pong maintain liveness on otherwise
//!  idle connections; token-bucket monitors pace both directions independently.
//!
//! Messages are delivered in order *within* a channel; there is no ordering guarantee across
//!  channels. There is no authentication, encryption or retransmission - that is the underlying
//!  stream's business (or a higher layer's).

pub mod channel;
pub mod config;
pub mod connection;
pub mod handler;
pub mod packet;
pub mod rate;
pub mod timer;
