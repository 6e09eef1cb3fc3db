//! Chat lifecycle and routing server for a WhatsApp customer-service console.

pub mod ai;
pub mod app;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod kanban;
pub mod ledger;
pub mod logging;
pub mod prompting;
pub mod realtime;
pub mod registry;
pub mod store;
pub mod types;
pub mod whatsapp;
