// Library for tests to access modules

pub mod agent_repo;
pub mod agent_rollup;
pub mod aggregate_repo;
pub mod blob_store;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod gauge_repo;
pub mod ingest;
pub mod log_forwarding;
pub mod models;
pub mod name_cache;
pub mod name_table;
pub mod rollup_pending;
pub mod rollup_schedule;
pub mod rollup_worker;
pub mod routes;
pub mod system_info;
pub mod trace_repo;
pub mod transport;
pub mod version;
