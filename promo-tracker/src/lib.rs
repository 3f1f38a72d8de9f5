pub mod api;
pub mod config;
pub mod dedup;
pub mod fetcher;
pub mod metrics_consts;
pub mod reporter;
pub mod session;
pub mod storage;
pub mod surface;
pub mod time;
pub mod tracker;
pub mod utils;
pub mod visibility;
