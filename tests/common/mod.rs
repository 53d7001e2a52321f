//! Common test utilities for usenet-indexer integration tests

#[allow(dead_code)]
pub mod fixtures;
#[allow(dead_code)]
pub mod news;

#[allow(unused_imports)]
pub use fixtures::*;
pub use news::*;
