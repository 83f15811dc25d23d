//! Core abstractions for UU: the plain preference store contract and the
//! serialized timer worker contract, plus in-memory doubles for both.

pub mod prefs;
pub mod timer;
