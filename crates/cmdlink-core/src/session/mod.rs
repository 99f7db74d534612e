//! Per-peer bookkeeping: session ids, reported identity, and clock-drift
//! estimation.

pub mod drift;
pub mod identity;
pub mod ids;
