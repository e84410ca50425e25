/*!
# Fleet DevKit - stubs and helpers for node-fleet tests

Lets the fleet be exercised without network access or real node binaries:
- In-memory release distribution and version authority
- Recording nodes and version stores for coordinator tests
- Shell-script node fixtures and test logging
*/

pub mod distribution_stub;
pub mod test_utils;

pub use distribution_stub::{zip_archive, MockDistribution, MockVersionSource};
pub use test_utils::{
    calls, fleet_cache, init_test_logging, Journal, MemoryVersionStore, NodeCall, RecordingNode,
};

#[cfg(unix)]
pub use test_utils::write_script;
