//! # appbackup testkit
//!
//! Test doubles for appbackup.
//!
//! This crate provides:
//! - A scriptable in-memory transport
//! - Mock agents and an agent host that records binds
//! - An in-memory package manager and side channel
//! - Recording observers
//! - A ready-wired [`TestEnv`] and archive builders
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use appbackup_testkit::prelude::*;
//!
//! let env = TestEnv::new();
//! env.install(app("com.example", 1));
//! env.request(&["com.example"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod agents;
pub mod fixtures;
pub mod generators;
pub mod observers;
pub mod packages;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agents::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::observers::*;
    pub use crate::packages::*;
    pub use crate::transport::*;
}

pub use agents::*;
pub use fixtures::*;
pub use generators::*;
pub use observers::*;
pub use packages::*;
pub use transport::*;
