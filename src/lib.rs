pub mod api;
pub mod browser;
pub mod config;
pub mod crawler;
pub mod data_models;
pub mod db;
pub mod detector;
pub mod error;
pub mod marketplace;
pub mod normalizer;
pub mod notify;
pub mod page;
pub mod scheduler;
pub mod session;
pub mod store;
