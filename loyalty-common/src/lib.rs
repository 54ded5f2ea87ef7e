pub mod cache;
pub mod event;
pub mod metrics;
pub mod store;
pub mod test_utils;
