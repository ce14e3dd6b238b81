pub mod config;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod nvr;
pub mod pipeline;
pub mod purge;
pub mod supervisor;
pub mod template;
pub mod transfer;

pub use config::{Cli, Config};
pub use error::Error;
pub use ledger::{Ledger, LedgerRow};
pub use supervisor::Supervisor;
