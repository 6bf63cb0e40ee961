//! Readiness distribution for consumers.
//!
//! A consumer may hold several broker connections but only has
//! `max_in_flight` units of readiness to share between them. The pure
//! bookkeeping lives in [`Distribution`]; [`FlowController`] owns one inside
//! a task, feeds it delivered messages and settle requests, and sends the
//! resulting `RDY` updates to each broker.
//!
//! ## Modes
//!
//! - **Normal** (`max_in_flight >= connections`): each connection gets
//!   `ideal - in_flight`, where `ideal = max_in_flight / connections`.
//! - **Scarce** (`max_in_flight < connections`): at most `max_in_flight`
//!   connections hold readiness 1. A watchdog periodically moves readiness
//!   from a random holder to the next waiting connection so every broker
//!   gets served.
//!
//! Failed messages put their connection into a linear backoff during which
//! it is given no readiness.

mod controller;
mod state;

pub use controller::{FlowConfig, FlowController, Outcome};
pub use state::{ConnectionRecord, Distribution, DistributionSnapshot};
