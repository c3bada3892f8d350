//! CLI command implementations.
//!
//! | Module   | Commands handled          |
//! |----------|---------------------------|
//! | `run`    | `Run`, `Cancel`           |
//! | `status` | `Status`, `Watch`, `Runs` |
//! | `config` | `Config`                  |

pub mod config;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use run::{cmd_cancel, cmd_run};
pub use status::{cmd_runs, cmd_status, cmd_watch};
