// =============================================================================
// Admin surface — read-only REST + WebSocket dashboard feed
// =============================================================================

pub mod rest;
pub mod ws;
