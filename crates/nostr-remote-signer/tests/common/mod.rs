//! Test utilities

use std::sync::Arc;

use nostr_remote_signer::{MemoryRelayNetwork, RemoteSigner, SignerConfig};

pub mod bunker;
pub use bunker::{Behavior, FakeBunker};

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timings so the suite does not sit in settle delays.
#[allow(dead_code)]
pub fn fast_config() -> SignerConfig {
    SignerConfig {
        request_timeout_ms: 5_000,
        settle_delay_ms: 10,
        ..Default::default()
    }
}

/// Network with the given relays online.
#[allow(dead_code)]
pub fn network_with(relays: &[&str]) -> MemoryRelayNetwork {
    let network = MemoryRelayNetwork::new();
    for relay in relays {
        network.add_relay(relay);
    }
    network
}

#[allow(dead_code)]
pub fn relays(urls: &[&str]) -> Vec<String> {
    urls.iter().map(|u| u.to_string()).collect()
}

#[allow(dead_code)]
pub fn signer_on(network: &MemoryRelayNetwork) -> RemoteSigner {
    RemoteSigner::new(Arc::new(network.clone()), fast_config())
}
