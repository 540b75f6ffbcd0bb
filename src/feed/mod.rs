pub mod cache;
pub mod hotkey;
pub mod invalidation;
