//! Recurring Service - Scheduled generation of invoices from recurring billing schedules.

pub mod config;
pub mod generation;
pub mod models;
pub mod services;
pub mod startup;
