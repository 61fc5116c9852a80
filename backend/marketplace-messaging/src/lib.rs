pub mod backends;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod realtime;
pub mod services;
pub mod session;
pub mod state;
