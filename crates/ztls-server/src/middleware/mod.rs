//! Request middlewares applied to individual routes.
pub mod auth;
pub mod rate_limit;
