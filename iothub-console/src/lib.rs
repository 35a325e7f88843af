pub mod assembly;
pub mod config;
pub mod handlers;
pub mod models;
pub mod reconcile;
pub mod services;
pub mod startup;
