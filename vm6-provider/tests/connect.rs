//! Provider construction from validated configuration.

use std::sync::Arc;

use clap::Parser;
use vm6_provider::{Credentials, MemoryRemote, Provider, ProviderConfig};

#[tokio::test]
async fn test_connect_authenticates_and_sets_debug() {
    let config = ProviderConfig::try_parse_from([
        "vm6-provider",
        "--api-url",
        "https://vm.example.com/",
        "--api-token",
        "t0k",
        "--parallel",
        "7",
        "--debug",
    ])
    .unwrap()
    .validate()
    .unwrap();

    let remote = Arc::new(MemoryRemote::new());
    let provider = Provider::connect(remote.clone(), &config).await.unwrap();

    assert_eq!(provider.throttle().max_parallel(), 7);
    assert!(remote.debug_enabled());
    assert_eq!(remote.credentials().await, Some(Credentials::Token("t0k".into())));
    assert_eq!(remote.calls().await, vec!["authenticate"]);
}

#[tokio::test]
async fn test_connect_surfaces_auth_failure() {
    let config = ProviderConfig::try_parse_from([
        "vm6-provider",
        "--api-url",
        "https://vm.example.com/",
        "--api-token",
        "t0k",
    ])
    .unwrap()
    .validate()
    .unwrap();

    let remote = Arc::new(MemoryRemote::new());
    remote
        .fail_call(
            "authenticate",
            0,
            vm6_provider::RemoteError::Auth("token expired".into()),
        )
        .await;

    let err = Provider::connect(remote, &config).await.err().unwrap();
    assert!(err.to_string().contains("token expired"));
}
