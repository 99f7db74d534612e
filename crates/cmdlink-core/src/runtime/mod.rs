//! Connection runtime shared by both sides: the link itself, the command
//! registry it dispatches through, and outbound payload staging.

pub mod link;
pub mod registry;
pub mod staging;
