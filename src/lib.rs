//! In-process serial-line Z-Wave interceptor.
//!
//! Sits between a home-automation host and a Z-Wave radio controller
//! attached to a character device, transparently framing every byte that
//! passes in either direction and matching it against a registered rule
//! set that can observe (monitor), suppress and synthesize a reply for
//! (intercept), or rewrite (forward) traffic. Matches are reported
//! out-of-band as HTTP GETs to a local control endpoint (§4.6).
//!
//! This crate is the interception engine itself: the framer/dispatcher,
//! the rule store, the response-template synthesizer, and the
//! notification queue. The embedding glue that exposes these calls to a
//! host runtime, and the discovery of the host's already-open device fd,
//! are the caller's responsibility — see [`splice::Splicer`] for the
//! seam between the two.
//!
//! ```no_run
//! # #[cfg(feature = "test-util")]
//! # async fn example() -> Result<(), zwave_interceptor::Error> {
//! use zwave_interceptor::{config::EngineConfig, splice::PairSplicer, Engine};
//!
//! let engine = Engine::new(PairSplicer::new(), EngineConfig::default());
//! engine.register("/dev/ttyS0").await?;
//! engine
//!     .monitor(5, "k1".into(), "^01 .. 00 04", false, 0, None, None, false)
//!     .await?;
//! engine.unregister(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod hex;
pub mod ioloop;
pub mod notify;
pub mod rule;
pub mod splice;
pub mod template;

pub use engine::Engine;
pub use error::{Error, Result};
