//! Race-day engine for kart championship stages: fleet management, kart draw,
//! results ledger, timing-sheet import, penalties and rankings, persisted to
//! the championship backend and served over Socket.IO.

pub mod api_client;
pub mod autosave;
pub mod config;
pub mod draw;
pub mod draw_engine;
pub mod fleet;
pub mod handlers;
pub mod import;
pub mod ledger;
pub mod penalties;
pub mod persistence;
pub mod race_time;
pub mod ranking;
pub mod session;
pub mod store;
pub mod workbook;
