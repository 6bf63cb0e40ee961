//! Control module - IDENTIFY payload and feature negotiation.
//!
//! Right after the version marker the client sends IDENTIFY with a JSON
//! body describing itself and the features it wants. When feature
//! negotiation is on, the server answers with JSON describing what it
//! granted ([`EndpointSettings`]); [`plan_upgrades`] turns that into the
//! ordered list of transport layers to install.
//!
//! # Workflow
//!
//! 1. Client writes `"  V2"`
//! 2. Client sends IDENTIFY ([`build_identify_body`])
//! 3. Server answers `OK` or negotiation JSON ([`EndpointSettings::from_response`])
//! 4. Client installs TLS, then compression, reading `OK` after each
//! 5. Client sends AUTH when the server requires it

mod features;
mod identify;

pub use features::{plan_upgrades, Upgrade};
pub use identify::{build_identify_body, AuthReply, EndpointSettings, IdentifyConfig};
