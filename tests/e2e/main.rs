//! Mock-cluster E2E test suite.
//!
//! All e2e tests live as submodules of this crate so that rustc can see
//! all usages of shared utilities and properly warn about dead code.


mod metadata;
mod produce_fetch;

pub use harness::{init_tracing, TestClient};
