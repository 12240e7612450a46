//! Domain services built on the provider and store seams.
//!
//! ARCHITECTURE
//! ============
//! The session manager owns auth state and its lifecycle; the profile
//! service owns the lazy "every identity has a profile" rule so both the
//! manager and sign-up can share it.

pub mod profile;
pub mod session;
