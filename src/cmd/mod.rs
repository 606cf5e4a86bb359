//! CLI command implementations.
//!
//! | Module        | Commands handled          |
//! |---------------|---------------------------|
//! | `serve`       | `Serve`, `InitDb`         |
//! | `recalculate` | `Recalculate`             |
//! | `config`      | `Config`                  |

pub mod config;
pub mod recalculate;
pub mod serve;

pub use config::cmd_config;
pub use recalculate::cmd_recalculate;
pub use serve::{cmd_init_db, cmd_serve};
