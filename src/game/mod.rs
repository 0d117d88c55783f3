//! Game module
//!
//! Account-level logic of the char server:
//! - Auth correlation between clients and login verdicts
//! - Online presence directory and the forced-disconnect timer
//! - Operator broadcast segmentation
//! - Hooks into character content

pub mod auth;
pub mod broadcast;
pub mod hooks;
pub mod presence;
