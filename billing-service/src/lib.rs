//! Billing and usage accounting for subscription plans, hour balances and invoices.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
