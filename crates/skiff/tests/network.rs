//! Address assignment across containers.

mod common;

use std::collections::HashSet;
use std::error::Error;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::{Behavior, Harness};
use skiff::runtime::ContainerSpec;
use skiff_common::ErrorKind;
use tempfile::TempDir;

fn running_harness() -> Harness {
    let harness = Harness::new();
    harness
        .isolator
        .set_behavior(Behavior::RunUntilSignaled { honors_term: true });
    harness
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_get_distinct_addresses() -> Result<(), Box<dyn Error>> {
    let roots: Vec<TempDir> = (0..8).map(|_| TempDir::new()).collect::<Result<_, _>>()?;
    let harness = running_harness();
    let registry = Arc::new(harness.registry());

    let ids = roots
        .iter()
        .map(|root| registry.submit(ContainerSpec::new(root.path(), ["/bin/app"]).with_network()))
        .collect::<Result<Vec<_>, _>>()?;

    let starts: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.start(&id).await })
        })
        .collect();
    for start in futures::future::join_all(starts).await {
        start??;
    }

    let addresses: HashSet<Ipv4Addr> = ids
        .iter()
        .map(|id| registry.get(id).map(|c| c.network.map(|b| b.address)))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(addresses.len(), ids.len());
    assert!(!addresses.contains(&Ipv4Addr::new(10, 88, 0, 1)));

    for id in &ids {
        registry.stop(id, Some(Duration::from_secs(1))).await?;
        registry.destroy(id).await?;
    }
    harness.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_fixed_address_conflict() -> Result<(), Box<dyn Error>> {
    let (first_root, second_root) = (TempDir::new()?, TempDir::new()?);
    let harness = running_harness();
    let registry = harness.registry();
    let address = Ipv4Addr::new(10, 88, 0, 7);

    let first = registry.submit(ContainerSpec::new(first_root.path(), ["/bin/app"]).with_address(address))?;
    registry.start(&first).await?;
    assert_eq!(
        registry.get(&first)?.network.map(|b| b.address),
        Some(address)
    );

    let second = registry.submit(ContainerSpec::new(second_root.path(), ["/bin/app"]).with_address(address))?;
    let err = registry.start(&second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    assert_eq!(err.root_cause().kind(), ErrorKind::AddressInUse);
    assert_eq!(harness.network.addresses_in_use(), 1);

    registry.stop(&first, Some(Duration::from_secs(1))).await?;
    registry.destroy(&first).await?;
    registry.destroy(&second).await?;
    harness.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_gateway_and_foreign_addresses_are_rejected() -> Result<(), Box<dyn Error>> {
    let root = TempDir::new()?;
    let harness = running_harness();
    let registry = harness.registry();

    for (address, kind) in [
        (Ipv4Addr::new(10, 88, 0, 1), ErrorKind::AddressInUse),
        (Ipv4Addr::new(192, 168, 1, 5), ErrorKind::AddressOutOfRange),
        (Ipv4Addr::new(10, 88, 0, 255), ErrorKind::AddressOutOfRange),
    ] {
        let id = registry.submit(ContainerSpec::new(root.path(), ["/bin/app"]).with_address(address))?;
        let err = registry.start(&id).await.unwrap_err();
        assert_eq!(err.root_cause().kind(), kind, "{address}");
        registry.destroy(&id).await?;
    }
    harness.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_released_address_is_reused() -> Result<(), Box<dyn Error>> {
    let root = TempDir::new()?;
    let harness = running_harness();
    let registry = harness.registry();

    let first = registry.submit(ContainerSpec::new(root.path(), ["/bin/app"]).with_network())?;
    registry.start(&first).await?;
    let address = registry.get(&first)?.network.map(|b| b.address);
    registry.stop(&first, Some(Duration::from_secs(1))).await?;
    registry.destroy(&first).await?;

    let second = registry.submit(ContainerSpec::new(root.path(), ["/bin/app"]).with_network())?;
    registry.start(&second).await?;
    assert_eq!(registry.get(&second)?.network.map(|b| b.address), address);

    registry.stop(&second, Some(Duration::from_secs(1))).await?;
    registry.destroy(&second).await?;
    harness.assert_clean();
    Ok(())
}

#[tokio::test]
async fn test_network_requires_net_namespace() -> Result<(), Box<dyn Error>> {
    use skiff::namespace::{NamespaceConfig, NamespaceKind};
    use skiff::runtime::{ContainerRegistry, RuntimeConfig};

    let root = TempDir::new()?;
    let harness = Harness::new();
    let config = RuntimeConfig::default()
        .with_namespaces(NamespaceConfig::new([NamespaceKind::Mount, NamespaceKind::Pid]));
    let registry = ContainerRegistry::new(harness.host(), config);

    let err = registry
        .submit(ContainerSpec::new(root.path(), ["/bin/app"]).with_network())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);

    // without networking the reduced set is fine
    let id = registry.submit(ContainerSpec::new(root.path(), ["/bin/app"]))?;
    registry.start(&id).await?;
    assert_eq!(registry.get(&id)?.namespaces.len(), 2);
    Ok(())
}
