mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tasklaunch::progress::{ProgressFileReader, ProgressListener};

type TestResult = Result<(), Box<dyn Error>>;

const POLL: Duration = Duration::from_millis(20);
const SETTLE: Duration = Duration::from_millis(200);

fn recorder() -> (Arc<Mutex<Vec<u8>>>, Arc<dyn ProgressListener>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Arc<dyn ProgressListener> =
        Arc::new(move |value: u8| sink.lock().unwrap().push(value));
    (seen, listener)
}

#[test]
fn listeners_see_each_value_once_in_order() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let reader = ProgressFileReader::with_interval(POLL);
    let (seen, listener) = recorder();
    reader.register(listener);

    let path = reader.start(dir.path(), "1000t1")?;
    assert!(path.starts_with(dir.path()));
    assert_eq!(reader.progress(), 0);

    for value in ["33", "66", "100"] {
        std::fs::write(&path, value)?;
        std::thread::sleep(SETTLE);
    }
    assert_eq!(*seen.lock().unwrap(), vec![33, 66, 100]);
    assert_eq!(reader.progress(), 100);

    std::fs::write(&path, "almost done")?;
    std::thread::sleep(SETTLE);
    std::fs::write(&path, "250")?;
    std::thread::sleep(SETTLE);

    assert_eq!(*seen.lock().unwrap(), vec![33, 66, 100]);
    assert_eq!(reader.progress(), 100);

    reader.stop();
    assert!(!reader.is_started());
    Ok(())
}

#[test]
fn unchanged_value_is_not_reported_twice() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let reader = ProgressFileReader::with_interval(POLL);
    let (seen, listener) = recorder();
    reader.register(listener);
    let path = reader.start(dir.path(), "task")?;

    std::fs::write(&path, "50")?;
    std::thread::sleep(SETTLE);
    std::fs::write(&path, " 50\n")?;
    std::thread::sleep(SETTLE);

    assert_eq!(*seen.lock().unwrap(), vec![50]);
    Ok(())
}

#[test]
fn unregistered_listener_gets_nothing() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let reader = ProgressFileReader::with_interval(POLL);
    let (seen, listener) = recorder();
    reader.register(Arc::clone(&listener));
    assert!(reader.unregister(&listener));

    let path = reader.start(dir.path(), "task")?;
    std::fs::write(&path, "10")?;
    std::thread::sleep(SETTLE);

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(reader.progress(), 10);
    Ok(())
}

#[test]
fn restart_uses_a_fresh_file() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let reader = ProgressFileReader::with_interval(POLL);

    let first = reader.start(dir.path(), "task")?;
    std::fs::write(&first, "40")?;
    std::thread::sleep(SETTLE);
    assert_eq!(reader.progress(), 40);

    let second = reader.start(dir.path(), "task")?;
    assert_ne!(first, second);
    assert_eq!(reader.progress(), 0);
    assert_eq!(reader.path(), Some(second.clone()));
    Ok(())
}
