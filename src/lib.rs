//! FHIR Bridge - keeps a downstream FHIR server in sync with a source FHIR server.
//!
//! Changes arrive through two channels: a `rest-hook` subscription pushing
//! each change as it happens, and a periodic delta poll that catches
//! whatever the push channel missed. See [`sync`] for how the two cooperate.

pub mod app;
pub mod config;
pub mod fhir;
pub mod persistence;
pub mod server;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_utils;
