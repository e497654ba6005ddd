pub mod event_lists;
pub mod local_store;
