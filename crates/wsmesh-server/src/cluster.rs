//! Inter-node cluster dispatch.
//!
//! Every cross-node operation rides the same packet format as end-user
//! traffic, on a reserved route, with a signed inner envelope as the
//! message. Without a dispatch hint the server does not know which peer
//! hosts the target session or channel, so the push operations fan out to
//! every peer in the group and non-hosting peers simply no-op; remote
//! calls pick a uniformly random peer instead. Callers that can shard
//! deterministically should always supply a hint.

use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};

use wsmesh_client::{BridgeClient, ClientConfig};
use wsmesh_core::packet::routes;
use wsmesh_core::{InnerEnvelope, MeshError, MeshResult, Response};

use crate::server::MessageServer;

/// One peer node in a cluster group.
pub struct Peer {
    /// Group (application) name the peer belongs to.
    pub group: String,
    /// WebSocket endpoint of the peer.
    pub url: String,
    /// The bridge client holding the peer link.
    pub client: BridgeClient,
}

/// Picks the index of the peer that should receive a dispatch.
/// Arguments: the group's peers, the target identity when the operation
/// has one, and the sealed envelope.
pub type DispatchHint = Arc<dyn Fn(&[Peer], Option<&str>, &InnerEnvelope) -> usize + Send + Sync>;

enum Fanout {
    /// Every peer in the group.
    All,
    /// One uniformly random peer.
    Random,
}

/// Resolve which peers of a non-empty group receive a dispatch. A hint
/// always wins; without one, `Fanout` decides.
fn choose(
    peers: &[Peer],
    tid: Option<&str>,
    envelope: &InnerEnvelope,
    hint: Option<&DispatchHint>,
    fanout: Fanout,
) -> MeshResult<Vec<usize>> {
    if let Some(hint) = hint {
        let index = hint(peers, tid, envelope);
        if index >= peers.len() {
            return Err(MeshError::Other(format!(
                "dispatch hint picked {index} of {} peers",
                peers.len()
            )));
        }
        return Ok(vec![index]);
    }
    match fanout {
        Fanout::All => Ok((0..peers.len()).collect()),
        Fanout::Random => Ok(vec![rand::thread_rng().gen_range(0..peers.len())]),
    }
}

impl MessageServer {
    /// Open one bridge client per configured peer. Peer links use the
    /// server's own codec settings, heartbeat at the supervisor cadence,
    /// and a tight reconnect period.
    pub(crate) async fn connect_peers(&self) {
        let config = self.config();
        let mut clusters = self.clusters.write().await;
        for (group, nodes) in &config.links {
            let peers: Vec<Peer> = nodes
                .iter()
                .map(|node| {
                    let url = node.url();
                    let mut client_config = ClientConfig::new(url.clone());
                    client_config.password = config.password.clone();
                    client_config.binary = config.binary;
                    client_config.heartick_secs = (config.cycle_ms / 1000).max(1);
                    client_config.conntick_secs = 2;
                    info!(group = %group, url = %url, "connecting cluster peer");
                    Peer {
                        group: group.clone(),
                        url,
                        client: BridgeClient::connect(client_config),
                    }
                })
                .collect();
            clusters.insert(group.clone(), peers);
        }
    }

    pub(crate) async fn disconnect_peers(&self) {
        for (_, peers) in self.clusters.write().await.drain() {
            for peer in peers {
                peer.client.disconnect();
            }
        }
    }

    /// Whether a group has at least one peer and every peer link is up.
    pub async fn cluster_connected(&self, group: &str) -> bool {
        let clusters = self.clusters.read().await;
        match clusters.get(group) {
            Some(peers) if !peers.is_empty() => {
                peers.iter().all(|peer| peer.client.is_connected())
            }
            _ => false,
        }
    }

    fn require_secret(&self) -> MeshResult<&str> {
        self.config()
            .secret
            .as_deref()
            .ok_or_else(|| MeshError::Config("cluster traffic requires a secret".into()))
    }

    /// Pick the target peers' clients for one dispatch. Unknown and empty
    /// groups are an error; the remote-call operations bubble it.
    async fn select_peers(
        &self,
        group: &str,
        tid: Option<&str>,
        envelope: &InnerEnvelope,
        hint: Option<&DispatchHint>,
        fanout: Fanout,
    ) -> MeshResult<Vec<BridgeClient>> {
        let clusters = self.clusters.read().await;
        let peers = clusters
            .get(group)
            .filter(|peers| !peers.is_empty())
            .ok_or_else(|| MeshError::ClusterGroup(group.to_string()))?;
        let indices = choose(peers, tid, envelope, hint, fanout)?;
        Ok(indices
            .into_iter()
            .map(|index| peers[index].client.clone())
            .collect())
    }

    /// Fan-out selection for the push operations: an unknown group or a
    /// bad hint is logged and drops the dispatch instead of erroring.
    async fn select_peers_fanout(
        &self,
        group: &str,
        tid: Option<&str>,
        envelope: &InnerEnvelope,
        hint: Option<&DispatchHint>,
    ) -> Vec<BridgeClient> {
        match self
            .select_peers(group, tid, envelope, hint, Fanout::All)
            .await
        {
            Ok(clients) => clients,
            Err(e) => {
                warn!(group = %group, route = %envelope.route, error = %e, "cluster dispatch dropped");
                Vec::new()
            }
        }
    }

    /// Deliver to the session bound to `uid` somewhere in the group.
    /// An unknown group is logged and dropped.
    pub async fn push_cluster_session(
        &self,
        group: &str,
        uid: &str,
        route: &str,
        message: Value,
        hint: Option<&DispatchHint>,
    ) -> MeshResult<()> {
        let secret = self.require_secret()?;
        let envelope = InnerEnvelope::seal(Some(uid.to_string()), route, message, secret);
        for client in self
            .select_peers_fanout(group, Some(uid), &envelope, hint)
            .await
        {
            let _ = client.cast(routes::INNER_P2P, envelope.to_value());
        }
        Ok(())
    }

    /// Deliver to every member of channel `gid` somewhere in the group.
    /// An unknown group is logged and dropped.
    pub async fn push_cluster_channel(
        &self,
        group: &str,
        gid: &str,
        route: &str,
        message: Value,
        hint: Option<&DispatchHint>,
    ) -> MeshResult<()> {
        let secret = self.require_secret()?;
        let envelope = InnerEnvelope::seal(Some(gid.to_string()), route, message, secret);
        for client in self
            .select_peers_fanout(group, Some(gid), &envelope, hint)
            .await
        {
            let _ = client.cast(routes::INNER_GRP, envelope.to_value());
        }
        Ok(())
    }

    /// Deliver to every UID-bound session on every node of the group.
    /// An unknown group is logged and dropped.
    pub async fn cluster_broadcast(
        &self,
        group: &str,
        route: &str,
        message: Value,
        hint: Option<&DispatchHint>,
    ) -> MeshResult<()> {
        let secret = self.require_secret()?;
        let envelope = InnerEnvelope::seal(None, route, message, secret);
        for client in self.select_peers_fanout(group, None, &envelope, hint).await {
            let _ = client.cast(routes::INNER_ALL, envelope.to_value());
        }
        Ok(())
    }

    /// Fire-and-forget remote procedure call on one peer of the group.
    pub async fn call_remote(
        &self,
        group: &str,
        route: &str,
        message: Value,
        hint: Option<&DispatchHint>,
    ) -> MeshResult<()> {
        let secret = self.require_secret()?;
        let envelope = InnerEnvelope::seal(None, route, message, secret);
        let clients = self
            .select_peers(group, None, &envelope, hint, Fanout::Random)
            .await?;
        for client in clients {
            client.cast(routes::INNER_RMC, envelope.to_value())?;
        }
        Ok(())
    }

    /// Remote procedure call on one peer of the group, awaiting the
    /// response envelope. The caller always receives the envelope; the
    /// `code` field carries success or failure, including the 504 the peer
    /// link synthesizes on timeout.
    pub async fn call_remote_for_result(
        &self,
        group: &str,
        route: &str,
        message: Value,
        hint: Option<&DispatchHint>,
    ) -> MeshResult<Response> {
        let secret = self.require_secret()?;
        let envelope = InnerEnvelope::seal(None, route, message, secret);
        let mut clients = self
            .select_peers(group, None, &envelope, hint, Fanout::Random)
            .await?;
        let client = clients
            .pop()
            .ok_or_else(|| MeshError::ClusterGroup(group.to_string()))?;
        client.call(routes::INNER_RMC, envelope.to_value()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Nothing listens on these endpoints; the clients retry in the
    // background while selection is exercised.
    fn peer(index: usize) -> Peer {
        let url = format!("ws://127.0.0.1:{}", 40_000 + index);
        Peer {
            group: "grp".into(),
            url: url.clone(),
            client: BridgeClient::connect(ClientConfig::new(url)),
        }
    }

    fn group_of(count: usize) -> Vec<Peer> {
        (0..count).map(peer).collect()
    }

    fn envelope() -> InnerEnvelope {
        InnerEnvelope::seal(Some("u".into()), "evt", json!(1), "s")
    }

    #[tokio::test]
    async fn no_hint_fans_out_to_every_peer() {
        let peers = group_of(3);
        let indices = choose(&peers, Some("u"), &envelope(), None, Fanout::All).unwrap();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn no_hint_random_picks_exactly_one_peer() {
        let peers = group_of(3);
        for _ in 0..20 {
            let indices = choose(&peers, None, &envelope(), None, Fanout::Random).unwrap();
            assert_eq!(indices.len(), 1);
            assert!(indices[0] < peers.len());
        }
    }

    #[tokio::test]
    async fn hint_overrides_both_fanout_modes() {
        let peers = group_of(3);
        let seen_len = Arc::new(AtomicUsize::new(0));
        let seen = seen_len.clone();
        let hint: DispatchHint = Arc::new(move |list, tid, env| {
            seen.store(list.len(), Ordering::SeqCst);
            assert_eq!(tid, Some("u"));
            assert_eq!(env.route, "evt");
            1
        });
        let env = envelope();

        let indices = choose(&peers, Some("u"), &env, Some(&hint), Fanout::All).unwrap();
        assert_eq!(indices, vec![1]);
        assert_eq!(seen_len.load(Ordering::SeqCst), 3);

        let indices = choose(&peers, Some("u"), &env, Some(&hint), Fanout::Random).unwrap();
        assert_eq!(indices, vec![1]);
    }

    #[tokio::test]
    async fn out_of_range_hint_is_an_error() {
        let peers = group_of(2);
        let hint: DispatchHint = Arc::new(|_, _, _| 7);
        assert!(choose(&peers, None, &envelope(), Some(&hint), Fanout::All).is_err());
        assert!(choose(&peers, None, &envelope(), Some(&hint), Fanout::Random).is_err());
    }

    #[tokio::test]
    async fn unknown_group_is_a_noop_for_pushes_and_an_error_for_calls() {
        let mut config = ServerConfig::new(0);
        config.secret = Some("s".into());
        let server = MessageServer::new(config).unwrap();
        // A configured-but-empty group behaves like an unknown one.
        server.clusters.write().await.insert("empty".into(), Vec::new());

        for group in ["ghost", "empty"] {
            assert!(server
                .push_cluster_session(group, "u", "evt", json!(1), None)
                .await
                .is_ok());
            assert!(server
                .push_cluster_channel(group, "g", "evt", json!(1), None)
                .await
                .is_ok());
            assert!(server
                .cluster_broadcast(group, "evt", json!(1), None)
                .await
                .is_ok());
            assert!(matches!(
                server.call_remote(group, "evt", json!(1), None).await,
                Err(MeshError::ClusterGroup(_))
            ));
            assert!(matches!(
                server
                    .call_remote_for_result(group, "evt", json!(1), None)
                    .await,
                Err(MeshError::ClusterGroup(_))
            ));
        }
    }

    #[tokio::test]
    async fn bad_hint_drops_pushes_but_fails_calls() {
        let mut config = ServerConfig::new(0);
        config.secret = Some("s".into());
        let server = MessageServer::new(config).unwrap();
        server.clusters.write().await.insert("grp".into(), group_of(2));
        let hint: DispatchHint = Arc::new(|_, _, _| 9);

        assert!(server
            .push_cluster_session("grp", "u", "evt", json!(1), Some(&hint))
            .await
            .is_ok());
        assert!(server
            .call_remote("grp", "evt", json!(1), Some(&hint))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn missing_secret_fails_every_operation() {
        let server = MessageServer::new(ServerConfig::new(0)).unwrap();
        server.clusters.write().await.insert("grp".into(), group_of(1));
        assert!(server
            .push_cluster_session("grp", "u", "evt", json!(1), None)
            .await
            .is_err());
        assert!(server.call_remote("grp", "evt", json!(1), None).await.is_err());
    }
}
