//! `netimg` moves a single image from an image server (`imgdb`) to a client (`netimg`) over UDP,
//!  adding just enough reliability on top of the datagram channel to make the transfer complete
//!  and byte-exact even when packets are lost in both directions.
//!
//! ## Design
//!
//! * A capability handshake: the client queries for an image by name, announcing its maximum
//!   segment size, receive window and FEC window. The server answers with the image's geometry
//!   (or an error code), and the client acknowledges the answer before any data flows.
//! * The image is sent as segments whose sequence number is the *byte offset* of the segment's
//!   payload in the image. ACKs and retransmissions address the image buffer directly.
//! * The sender keeps a sliding window of `rwnd` segments and slides it on cumulative ACKs. If no
//!   ACK progress happens for a retransmission timeout, it goes back to the oldest unacknowledged
//!   byte and re-sends everything from there (Go-Back-N).
//! * After every `fwnd` data segments the sender emits an FEC segment carrying the XOR of the
//!   group's payloads. The receiver repairs a single lost segment per group from it without
//!   waiting for a retransmission. Two or more losses in a group put the receiver into Go-Back-N
//!   mode, waiting for the sender's retransmission to resynchronize.
//! * The transfer ends with a FIN / ACK exchange with a bounded number of retries.
//!
//! The protocol is single-threaded on both sides: the sender suspends only while waiting for ACKs
//!  (with a timeout), and the receiver processes one ready datagram per event and never blocks.
//!
//! ## Wire format
//!
//! All multi-byte numbers are in network byte order (BE).
//!
//! Query (client to server, 262 bytes):
//! ```ascii
//! 0: version (u8) - 0x11
//! 1: type (u8) - SYN_QUERY
//! 2: mss (u16) - maximum segment size including all headers
//! 4: rwnd (u8) - receive window in segments
//! 5: fwnd (u8) - FEC window in segments, < rwnd
//! 6: image name (256 bytes, NUL terminated)
//! ```
//!
//! Image message (server to client, 8 bytes):
//! ```ascii
//! 0: version (u8)
//! 1: type (u8) - FOUND, NOT_FOUND or one of the ERROR codes
//! 2: depth (u8) - bytes per pixel
//! 3: format (u8) - gray scale / gray scale + alpha / RGB / RGBA
//! 4: width (u16)
//! 6: height (u16)
//! ```
//!
//! Segment header (both directions, 8 bytes, followed by `size` payload bytes for DATA and FEC):
//! ```ascii
//! 0: version (u8)
//! 1: type (u8) - DATA, FEC, ACK or FIN
//! 2: size (u16) - payload size
//! 4: seqn (u32) - byte offset; for ACK the next expected offset
//! ```
//!
//! Two sequence numbers are reserved: `0xffff_ffff` acknowledges the image message, and
//!  `0xffff_fffe` marks FIN and its ACK.

pub mod config;
pub mod control_messages;
pub mod display;
pub mod fec;
pub mod image_store;
pub mod loss;
pub mod packet_header;
pub mod receive_sequencer;
pub mod receiver;
pub mod send_window;
pub mod sender;
pub mod seqn;
pub mod server;
pub mod socket;
pub mod stats;
pub mod test_util;
pub mod tga;
