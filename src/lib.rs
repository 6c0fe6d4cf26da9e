pub mod app;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod journal;
pub mod ledger;
pub mod output;
pub mod pool;
pub mod prompt;
pub mod sink;
pub mod stamp;
pub mod task_source;
