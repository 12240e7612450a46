//! League session coordinator.
//!
//! ARCHITECTURE
//! ============
//! The [`services::session::SessionManager`] owns the process-wide auth state
//! and reconciles it against two injected collaborators: an
//! [`provider::IdentityProvider`] (who is logged in) and a
//! [`store::ProfileStore`] (the league profile for that identity). Concrete
//! implementations for a GoTrue-style auth service and Postgres live next to
//! the traits; tests substitute hand-written doubles.

pub mod config;
pub mod db;
pub mod provider;
pub mod retry;
pub mod services;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;
