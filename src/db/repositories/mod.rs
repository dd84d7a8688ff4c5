pub mod kv_store;
pub mod pending_readings;
