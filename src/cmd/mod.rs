//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled          |
//! |----------|---------------------------|
//! | `serve`  | `Serve`                   |
//! | `admin`  | `InitDb`, `CreateUser`    |
//! | `config` | `Config`                  |

pub mod admin;
pub mod config;
pub mod serve;

pub use admin::{NewAccount, cmd_create_user, cmd_init_db};
pub use config::cmd_config;
pub use serve::cmd_serve;
