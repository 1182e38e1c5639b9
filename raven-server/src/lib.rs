//! TCP front end for the Raven engine.
//!
//! The engine itself is single-threaded and knows nothing about sockets;
//! this crate owns the accept loop, per-connection reader/writer tasks,
//! and the event loop that feeds bytes into the engine and flushes its
//! output after every scheduling round.

pub mod server;
