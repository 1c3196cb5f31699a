//! Adapter protocol: command framing and reply decoding.
//!
//! This module contains the implementations for:
//! - ELM327-style command framing and the write fallback
//! - Mode 01 reply parsing and the PID decoder registry

pub mod command;
pub mod pid;

pub use command::{frame_command, is_pid_command, CommandChannel, INIT_SEQUENCE};
pub use pid::{DecoderRegistry, ParsedMetric, PidDecoder};
