//! `lanio`: async framed I/O for the game's native TCP wire.
//!
//! Every frame on this wire is:
//! - byte 0: `0xFF` magic
//! - byte 1: command code
//! - bytes 2..3: total frame length including the 4-byte header (`u16` little-endian)
//! - bytes 4..: payload
//!
//! A single TCP read may carry any number of concatenated frames and may end
//! mid-frame; [`frame::FrameSplitter`] buffers the tail until the rest arrives.

pub mod frame;
pub mod strings;
