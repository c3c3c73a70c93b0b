//! ActivityPro tracker: activity, timer and productivity back-end.
//!
//! ## Overview
//!
//! Activities move through `next → in_progress → paused → completed /
//! cancelled`. Every timer action is a single guarded update in one SQLite
//! transaction together with its audit-log insert; each user may have at
//! most one running activity. Mutations are pushed to connected browsers
//! over a WebSocket, filtered by sector.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │   SPA    │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (browser)│ <─────── │    └─ api/  (route handlers, AppState, ApiError) │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ auth.rs  (AuthUser, Visibility)        │
//!                       │         │ lifecycle.rs  (next_status)            │
//!                       │         v                                        │
//!                       │  db/  (TrackerDb, DbHandle on spawn_blocking)    │
//!                       │         │                                        │
//!                       │         │ WsMessage + Audience                   │
//!                       │         v                                        │
//!                       │  ws.rs  (broadcast fan-out, presence.rs)         │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `models`    | Entities, views, request payloads, status enums         |
//! | `lifecycle` | Transition table and time arithmetic (no I/O)           |
//! | `auth`      | Argon2 passwords, bearer tokens, sector visibility      |
//! | `presence`  | Who is connected right now                              |
//!
//! ## Typical Request Flow (`POST /api/activities/:id/start`)
//!
//! 1. `AuthUser` resolves the bearer token to a `User`.
//! 2. `api::activities::start_activity()` calls
//!    `TrackerDb::apply_timer_action()` on the blocking pool.
//! 3. Inside one transaction the store checks permission and the transition,
//!    pauses any other running activity of the same user (or rejects with
//!    `TimerConflict`), opens a session row and writes the log rows.
//! 4. The handler broadcasts `ActivityStatusChanged` and a `FeedEvent` to
//!    the sockets whose viewer can see the activity.

pub mod api;
pub mod auth;
pub mod db;
pub mod lifecycle;
pub mod models;
pub mod presence;
pub mod server;
pub mod ws;
