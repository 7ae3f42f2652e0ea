//! HTTP handlers for billing-service.

pub mod auth;
pub mod client;
pub mod health;
pub mod manager;

pub use auth::{AuthContext, ClientContext, ManagerContext, UserRole, USER_ID_HEADER, USER_ROLE_HEADER};
