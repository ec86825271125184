//! The sandbox worker process.
//!
//! A controller spawns `pvm-sandbox` with one end of a Unix socket pair as its standard input.
//! The worker answers execute requests on that channel until the controller closes it, running
//! every program with the in-process interpreter under optional resource limits.

mod args;
pub use args::*;

mod limits;
pub use limits::*;

mod logging;
pub use logging::*;

mod server;
pub use server::*;
