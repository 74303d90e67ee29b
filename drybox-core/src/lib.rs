//! DryBox: a deterministic, tick-driven simulator of a two-endpoint
//! telecommunications link.
//!
//! A [`scenario::ScenarioResolved`] describes one run: a bearer impairment
//! model, an optional sample-domain channel and vocoder (audio mode), and a
//! pair of adapters exchanging either datagrams or PCM frames across it.
//! [`engine::Engine`] drives the run tick by tick, recording a replayable
//! binary capture and a tabular metrics stream as it goes.

pub mod adapter;
pub mod bearer;
pub mod builtin_adapters;
pub mod capture;
pub mod channel;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod sar;
pub mod scenario;
pub mod vocoder;

pub use engine::{Engine, EngineConfig};
pub use errors::{DryBoxError, Result};
pub use scenario::ScenarioResolved;
