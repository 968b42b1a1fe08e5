//! Turns raw agent container output into typed step payloads.

pub mod classify;
pub mod demux;
pub mod processor;

pub use demux::{decode_container_output, demultiplex, looks_multiplexed};
pub use processor::{process, LogProcessor, StepPayload};
