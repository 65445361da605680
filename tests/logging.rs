mod common;

use common::*;
use logwise::InMemoryLogger;
use logwise::global_logger::set_global_loggers;
use std::sync::Arc;

#[test]
fn upstream_is_logged_as_host_and_port() {
    let logger = Arc::new(InMemoryLogger::new());
    set_global_loggers(vec![logger.clone()]);

    let upstream_port = free_port();
    let (addr, handle) = start_relay(upstream_port, fast_config());
    let _client = connect(addr);
    assert!(wait_for(|| handle.stats().upstream_attempts >= 2));
    handle.shutdown();
    handle.join().unwrap();

    let logs = logger.drain_logs();
    assert!(logs.contains(&format!("127.0.0.1:{upstream_port}")), "{logs}");
    assert!(logs.contains("cannot connect to"), "{logs}");
    assert!(!logs.contains("Upstream {"), "{logs}");
}
