//! Save shared chat transcripts: render the share page headlessly, pull the
//! user/assistant turns out of the DOM and keep them under a user account.

pub mod auth;
pub mod config;
pub mod db;
pub mod extract;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod server;
