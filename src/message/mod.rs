//! The controller's ASCII line protocol: chunk reassembly and frame decoding.

pub mod frame_buffer;
pub mod frame_decoder;

/// The verbatim request that makes the controller report its state.
pub const POLL_COMMAND: [u8; 2] = [0x4f, 0x4b];
