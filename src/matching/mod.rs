pub mod matcher;
pub mod normalize;

pub use matcher::{classify_phase, group_events, MatcherConfig};
pub use normalize::{normalize, Normalized};
