//! Leadflow CRM back-end.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Gateway  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (authn)  │ <─────── │    ├─ auth.rs  (Identity from x-* headers)       │
//! └──────────┘ WebSocket│    ├─ api/     (handlers, envelope, ApiError)    │
//!                       │    └─ ws.rs    (org-scoped live event feed)      │
//!                       │         │                                        │
//!                       │         │ incentives::calculate / approve / ...  │
//!                       │         v                                        │
//!                       │  incentives.rs  (workflow over the state machine)│
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  db.rs  (CrmDb on SQLite, DbHandle)              │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! The pure rules (calculator, state machine, permission table) live in the
//! `leadflow-core` crate; this module wires them to storage and HTTP.

pub mod api;
pub mod auth;
pub mod db;
pub mod incentives;
pub mod models;
pub mod server;
pub mod ws;
