#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod hub;
pub mod lifecycle;
pub mod listener;
pub mod registry;
pub mod router;
pub mod store;

#[cfg(test)]
mod connection_tests;


#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod store_tests;
