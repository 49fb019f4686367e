//! # wxrelay-channels
//!
//! Protocol service adapters for wxrelay.

pub mod wx849;
