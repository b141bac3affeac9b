pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod mail;
pub mod middleware;
pub mod platform;
pub mod server;
pub mod service;
pub mod types;

pub use config::Config;
pub use error::DeskError;
pub use service::AccountService;
