//! Process-level helpers shared by sluice binaries.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;
