//! Wire protocol: the envelope model, the string codec and framing, the
//! binary payload transform, and the reserved command codes.

pub mod binary;
pub mod codec;
pub mod codes;
pub mod envelope;
