pub mod config;
pub mod config_repository;
pub mod database;
pub mod proxy_repository;

pub use config::DatabaseConfig;
pub use config_repository::ParserConfigRepository;
pub use database::Database;
pub use proxy_repository::{NewProxy, ProxyRepository};
