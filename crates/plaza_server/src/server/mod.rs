#![forbid(unsafe_code)]

pub mod actor;
pub mod auth;
pub mod bridge;
pub mod chat;
pub mod connection;
pub mod health;
pub mod identity;
pub mod lobby;
pub mod observer;
pub mod presence;
pub mod repository;
pub mod state;

#[cfg(test)]
mod test_support;


#[cfg(test)]
mod bridge_tests;


#[cfg(test)]
mod identity_tests;

#[cfg(test)]
mod observer_tests;
