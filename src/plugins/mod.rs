//! Language back-ends. `notes` is the reference front-end shipped with the
//! core; hosts may register additional plugins against the same
//! `registry::Plugin` trait.

pub mod notes;
