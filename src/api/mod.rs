// =============================================================================
// JSON API façade
// =============================================================================

pub mod rest;

pub use rest::{router, ApiState};
