#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod endpoint;
pub mod error;
pub mod hexdump;
pub mod intercept;
pub mod ledger;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod reader;
pub mod report;
pub mod verify;

pub use endpoint::{Consumed, Endpoint, Flow, Flows, Mode, Shutdown};
pub use error::{HarnessError, Result, Violation};
pub use ledger::ByteLedger;
pub use process::{ProcessId, ProcessLedger, ProcessMeta, ProcessRecord};
pub use proxy::{ProxyCommand, SizePair};
pub use reader::{DrainConfig, drain};
pub use verify::{Verdict, check_transfer, verify};
