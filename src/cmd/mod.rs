//! CLI command implementations.
//!
//! | Module   | Commands handled          |
//! |----------|---------------------------|
//! | `serve`  | `Serve`                   |
//! | `admin`  | `InitDb`, `GrantAdmin`    |
//! | `config` | `Config`                  |

pub mod admin;
pub mod config;
pub mod serve;

pub use admin::{cmd_grant_admin, cmd_init_db};
pub use config::cmd_config;
pub use serve::cmd_serve;
