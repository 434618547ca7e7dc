pub mod dual_ledger;
pub mod program;
pub mod setup;

pub use dual_ledger::{DualLedger, Fault, LedgerEndpoint};
pub use setup::{init_test_logging, test_sync_config, wait_until, TestEnv};
