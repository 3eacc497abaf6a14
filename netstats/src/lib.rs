//! The netstats daemon
//!
//! This library hosts [`netstats_core::service::Service`] on a Linux host:
//! configuration, host collaborators and the event loop. The binaries in
//! this crate are thin wrappers around it.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod daemon;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod platform;
