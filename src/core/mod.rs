//! Query/view synchronization core.

pub mod api;
pub mod editor;
pub mod error;
pub mod query;
pub mod sequence;
pub mod summary;
pub mod transport;
pub mod types;
pub mod view;
