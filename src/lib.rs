pub mod api;
pub mod client;
pub mod config;
pub mod db;
pub mod http;
pub mod issuer;
pub mod notifier;
pub mod payment;
pub mod pricing;

pub use self::config::Config;
