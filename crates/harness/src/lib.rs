pub mod device;
pub mod faults;

pub use device::{PhotoLog, RecordingPhotos, TestDevice};
pub use faults::{Fault, FaultyStore, FlakyCard};

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test writer. Filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
