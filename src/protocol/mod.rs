// =============================================================================
// Host link protocol — newline-delimited JSON frames and their codec
// =============================================================================

pub mod codec;
pub mod messages;
