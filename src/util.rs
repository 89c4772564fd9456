//! Shared utility modules.

pub mod set_once;
