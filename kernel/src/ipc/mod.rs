//! Inter-process communication primitives.
//!
//! Two layers, built bottom-up: the [`pipe`] channel is a bounded byte
//! stream between a reader end and a writer end; the [`socket`] rendezvous
//! layer builds connection-oriented sockets out of pipe pairs wired in
//! opposite directions.

pub mod pipe;
pub mod socket;
