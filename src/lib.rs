pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod scoring;
pub mod services;
pub mod state;
