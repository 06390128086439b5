//! Threshold-triggered audio capture
//!
//! A single actor task owns the capture state, one re-armable deadline and
//! at most one in-flight clip write.

mod controller;
mod deadline;

pub use controller::{CaptureConfig, CaptureController};

#[cfg(test)]
pub(crate) use controller::tests as testing;
