//! Kupa: a Hebrew WhatsApp budget bot over Google Sheets.

pub mod alert_log;
pub mod bot;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod model;
pub mod oracle;
pub mod retry;
pub mod server;
pub mod store;
pub mod whatsapp;
