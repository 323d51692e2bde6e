pub mod classify;
pub mod geometry;
pub mod overlap;
