//! Managed-mode handshake with a peer cluster

use tracing::info;

use meshfleet_common::crd::ClusterKey;
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Error, Result};
use meshfleet_config::MeshConfigApi;

/// Put the peer behind `peer` under this control plane.
///
/// A peer already managed by another control plane is refused. Otherwise
/// its role flags and identity are rewritten and saved; saving an already
/// converged document is skipped.
pub async fn ensure_managed(
    peer: &dyn MeshConfigApi,
    control_plane: &MeshConfig,
    key: &ClusterKey,
) -> Result<()> {
    let mut config = peer
        .load()
        .await?
        .ok_or_else(|| Error::fatal(format!("cluster {key} has no mesh config, is meshfleet installed?")))?;

    let owner = &control_plane.cluster.uid;
    if config.is_managed && config.cluster.control_plane_uid != *owner {
        return Err(Error::fatal(format!(
            "cluster {key} is already managed, cannot join the fleet"
        )));
    }

    let before = config.clone();
    config.is_managed = true;
    config.is_control_plane = false;
    config.cluster.control_plane_uid = owner.clone();
    config.cluster.region = key.region.clone();
    config.cluster.zone = key.zone.clone();
    config.cluster.group = key.group.clone();
    config.cluster.name = key.name.clone();

    if config != before {
        peer.save(&config).await?;
        info!(cluster = %key, control_plane = %owner, "cluster joined the fleet");
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::PeerConfig;
    use super::*;
    use meshfleet_common::mesh_config::sample_json;

    fn control_plane() -> MeshConfig {
        let mut config = MeshConfig::parse(sample_json()).unwrap();
        config.cluster.uid = "cp-uid".to_string();
        config
    }

    fn peer() -> MeshConfig {
        let mut config = MeshConfig::parse(sample_json()).unwrap();
        config.cluster.uid = "peer-uid".to_string();
        config
    }

    fn key() -> ClusterKey {
        ClusterKey::new("us", "east-1", "prod", "east")
    }

    #[tokio::test]
    async fn unmanaged_peer_joins_and_takes_identity() {
        let api = PeerConfig::with(peer());
        ensure_managed(&api, &control_plane(), &key()).await.unwrap();

        let stored = api.stored.lock().unwrap().clone().unwrap();
        assert!(stored.is_managed);
        assert!(!stored.is_control_plane);
        assert_eq!(stored.cluster.control_plane_uid, "cp-uid");
        assert_eq!(stored.cluster.name, "east");
        assert_eq!(stored.cluster.uid, "peer-uid");
    }

    #[tokio::test]
    async fn rejoining_is_idempotent() {
        let api = PeerConfig::with(peer());
        ensure_managed(&api, &control_plane(), &key()).await.unwrap();
        ensure_managed(&api, &control_plane(), &key()).await.unwrap();
        assert_eq!(*api.saves.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn peer_managed_elsewhere_is_refused() {
        let mut managed = peer();
        managed.is_managed = true;
        managed.cluster.control_plane_uid = "other-cp".to_string();
        let api = PeerConfig::with(managed);

        let err = ensure_managed(&api, &control_plane(), &key())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("cluster us/east-1/prod/east is already managed, cannot join the fleet"));
        assert!(!err.is_retryable());
        assert_eq!(*api.saves.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_mesh_config_is_fatal() {
        let api = PeerConfig::default();
        let err = ensure_managed(&api, &control_plane(), &key())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
