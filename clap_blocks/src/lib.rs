//! Building blocks for [`clap`]-driven configs.
//!
//! They can easily be re-used using `#[clap(flatten)]`.
pub mod memory_size;
pub mod sink;
pub mod socket_addr;
pub mod storage;
