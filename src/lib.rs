#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod accumulator;
pub mod constants;
pub mod controller;
pub mod db;
pub mod decoder;
pub mod events;
pub mod frames;
pub mod logging;
pub mod main_helper;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod store;
pub mod timing;
pub mod transcript;
pub mod transport;
pub mod types;

pub use types::*;

pub use controller::{
    ControllerConfig, FinishedSession, SessionOutcome, StreamController, SubmitRequest,
};
pub use main_helper::Args;
