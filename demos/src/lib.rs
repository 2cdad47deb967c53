//! # Strata Demos
//!
//! This crate contains examples demonstrating how to wire the strata stream
//! engine to a transport and a platform.
//!
//! Run a demo with:
//!
//! ```bash
//! cargo run --example echo -- --message "hello strata"
//! ```

#![warn(rust_2018_idioms)]

mod loopback;

pub use loopback::LoopbackTransport;
