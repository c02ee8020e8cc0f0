#![forbid(unsafe_code)]

pub mod alerts;
pub mod auth;
pub mod channel_hub;
pub mod connection;
pub mod health;
pub mod social;
pub mod state;
pub mod store;

#[cfg(test)]
mod alerts_tests;


#[cfg(test)]
mod connection_tests;
