#![forbid(unsafe_code)]

pub mod conntrack_sweep;
pub mod map_sync;
