//! meshwire: peer-to-peer typed-object distribution.
//!
//! Data nodes declare which typed objects they produce and consume; any
//! producer's mutation propagates in near-real-time to every interested
//! consumer across an arbitrary mesh of interconnected nodes, with
//! at-most-once ordered delivery by default and an opt-in lossless mode.
//!
//! This crate is the facade over the workspace:
//! - [`mw_codec`]: escaping, timestamps, delta compression, field codecs
//! - [`mw_protocol`]: the wire frame and control message vocabulary
//! - [`mw_core`]: channels, sequencing, the object tree, routing, the
//!   runtime
//!
//! ```no_run
//! use meshwire::core::{Runtime, TypeSpec, DefaultBehavior};
//! use meshwire::codec::fields::{FieldSpec, FieldCodec};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), meshwire::core::CoreError> {
//! let runtime = Runtime::builder()
//!     .app("ticker", "1.0")
//!     .register(TypeSpec::new(
//!         "Px",
//!         vec![FieldSpec::new("price", FieldCodec::Float)],
//!         Arc::new(DefaultBehavior),
//!     ))
//!     .produce("Px")
//!     .build()?;
//! runtime.start()?;
//! # Ok(())
//! # }
//! ```

pub use mw_codec as codec;
pub use mw_core as core;
pub use mw_protocol as protocol;
