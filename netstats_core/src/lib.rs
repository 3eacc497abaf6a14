//! The netstats accounting library
//!
//! This library tracks network usage by interface, by identity of the
//! underlying network and by owner. Periodic kernel counter snapshots are
//! turned into deltas, apportioned into fixed-width time buckets and
//! persisted into rotated history segments on disk. Consumers query the
//! resulting history through [`service::Service`] and its
//! [`service::Session`] handles.
//!
//! The platform the service runs on is reached only through the traits in
//! [`platform`], so that the accounting logic is independent of where the
//! counters come from.

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

pub mod codec;
pub mod collection;
pub mod dump;
pub mod history;
pub mod identity;
pub mod observer;
pub mod platform;
pub mod recorder;
pub mod rotator;
pub mod service;
pub mod settings;
pub mod stats;
pub mod template;
