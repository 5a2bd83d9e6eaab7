pub mod actions;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod notifications;
pub mod policy;
pub mod state;
pub mod status;
pub mod tokens;
pub mod users;
