//! File logging. Kept in its own test binary because the global subscriber
//! can only be installed once per process.

use vmharness::HarnessError;
use vmharness::util::LOG_FILE_NAME;

#[test]
fn file_logging_writes_events() {
    let dir = tempfile::tempdir().unwrap();
    let guard = vmharness::init_logging_to(dir.path()).unwrap();

    tracing::error!(machine = "vm0", "file logging works");

    let again = vmharness::init_logging_to(dir.path());
    assert!(matches!(again, Err(HarnessError::Config(_))));

    drop(guard);
    let content = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
    assert!(!content.is_empty());
    assert!(content.contains("file logging works"));
    assert!(content.contains("vm0"));
}
