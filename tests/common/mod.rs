//! Common test utilities

#![allow(dead_code)]

pub mod moonraker_mock;
pub mod test_fixtures;

pub use moonraker_mock::{MockMoonrakerServer, Reply};
