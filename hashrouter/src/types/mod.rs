//! Small value types shared across modules.

mod hash_rate;

pub use hash_rate::HashRate;
