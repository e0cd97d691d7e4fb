// Booking Session - Library root

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod store;
pub mod transport;
