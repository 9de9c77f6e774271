#![deny(unsafe_code)]

/// Terminal front end for one chat session.
pub mod app;
/// Transcript store and stream reconciliation.
pub mod chat;
/// Settings persistence.
pub mod settings;
#[cfg(test)]
pub(crate) mod testing;
