pub mod common;

mod config_store_tests;
mod proxy_store_tests;
