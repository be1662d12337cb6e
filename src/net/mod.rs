//! Thin traits over `mio`/`std` TCP types so the reactor and connection
//! table can be generic over either, letting tests run against
//! `std::net` without a poller.

pub mod tcp_listener;
pub mod tcp_stream;
