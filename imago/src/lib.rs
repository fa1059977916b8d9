//! Staging of replacement program images.
//!
//! This crate validates a requested physical memory layout, stages the
//! replacement image page by page while keeping every staging page off
//! other segments' destinations, and exports a self-contained tagged entry
//! list that an allocator-free executor replays after the host environment
//! has been torn down.
//!
//! The host kernel supplies page allocation and the architecture transition
//! through [`host::HostInterface`]; the load-then-execute protocol runs
//! under the process-wide [`session::Session`].
#![no_std]
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown
)]

extern crate alloc;

pub mod host;
pub mod image;
pub mod segment;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use image::Image;
pub use segment::{Provenance, Segment};
pub use session::{Session, SessionState};
