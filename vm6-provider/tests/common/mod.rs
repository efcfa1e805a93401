//! Shared fixtures for provider integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vm6_provider::model::{NetworkDesired, PoolDesired, VmDesired};
use vm6_provider::{Desired, MemoryRemote, Provider};

/// Provider wired to an in-memory remote.
pub struct TestProvider {
    pub remote: Arc<MemoryRemote>,
    pub provider: Provider,
}

impl TestProvider {
    pub fn new(max_parallel: usize) -> Self {
        Self::with_timeout(max_parallel, Duration::from_secs(30))
    }

    pub fn with_timeout(max_parallel: usize, timeout: Duration) -> Self {
        let remote = Arc::new(MemoryRemote::new());
        let provider = Provider::new(remote.clone(), max_parallel, timeout);
        Self { remote, provider }
    }
}

pub fn vm(name: &str) -> VmDesired {
    VmDesired {
        name: name.to_string(),
        cores: 2,
        memory: 2048,
        disk: 20000,
        domain: format!("{}.example.com", name),
        password: "secret".to_string(),
        os: 5,
        ..VmDesired::default()
    }
}

pub fn network(cidr: &str, gateway: &str) -> Desired {
    Desired::Network(NetworkDesired {
        network: cidr.to_string(),
        gateway: gateway.to_string(),
        desc: String::new(),
    })
}

pub fn pool(name: &str, ranges: &[&str]) -> PoolDesired {
    PoolDesired {
        pool: name.to_string(),
        ranges: ranges.iter().map(|r| r.to_string()).collect(),
        desc: String::new(),
        cluster: 1,
    }
}
