//! Running both ends of a transfer inside one process, without a network. Used by the protocol's
//!  own tests, and exported for applications that want to test a server and a client against
//!  each other.

pub mod memory_socket;
