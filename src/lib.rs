pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod routes;
pub mod store;
