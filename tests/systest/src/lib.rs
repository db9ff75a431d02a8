//! Shared scaffolding for the integration tests: each test gets its own
//! broker on a unique socket path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use axon_broker::{BrokerHandle, Config};
use axon_client::Connection;

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

pub struct TestBroker {
    pub handle: BrokerHandle,
    pub path: PathBuf,
}

pub fn start_broker() -> TestBroker {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::temp_dir().join(format!(
        "axon-systest-{}-{}.sock",
        std::process::id(),
        NEXT_SOCKET.fetch_add(1, Ordering::Relaxed)
    ));
    let config = Config {
        socket_path: path.clone(),
        ..Config::default()
    };
    let handle = axon_broker::start(config).expect("Failed to start a test broker");
    TestBroker { handle, path }
}

impl TestBroker {
    pub fn connect(&self) -> Connection {
        Connection::connect(&self.path).expect("Failed to connect to the test broker")
    }
}
