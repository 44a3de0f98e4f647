pub mod diff;
pub mod summary;
