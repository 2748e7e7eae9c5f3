//! Admin adapter: the REST router on a unix socket.
//!
//! Anyone who can open the socket is a local administrator, so every
//! request carries [`PeerIdentity::Local`].

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use axum::Router;
use flock_cluster::trust::PeerIdentity;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio_util::sync::CancellationToken;
use tower_http::add_extension::AddExtensionLayer;

/// Socket file mode: owner read/write only.
const SOCKET_MODE: u32 = 0o600;

pub async fn start(router: Router, path: PathBuf, cancel: CancellationToken) -> anyhow::Result<()> {
    // Remove stale socket file
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = tokio::net::UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    tracing::info!(path = %path.display(), "Admin socket listening");

    let app = router.layer(AddExtensionLayer::new(PeerIdentity::Local));

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _addr) = result?;
                let service = TowerToHyperService::new(app.clone());
                let token = cancel.clone();
                tokio::spawn(async move {
                    let builder = auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                tracing::debug!(error = %e, "Admin connection error");
                            }
                        }
                        _ = token.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.await;
                        }
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = std::fs::remove_file(&path);
    tracing::debug!("Admin socket stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use flock_client::ClusterClient;
    use flock_cluster::local::InProcessNetwork;
    use flock_cluster::settings::ClusterSettings;
    use flock_cluster::{ClusterCore, ClusterCoreConfig};
    use flock_crypto::identity::ServerIdentity;

    use super::*;

    fn temp_socket() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("flock-unix-test-{nanos}"))
            .join("unix.socket")
    }

    #[tokio::test]
    async fn socket_callers_are_trusted_and_socket_is_removed_on_stop() {
        let identity = ServerIdentity::generate("unix-test").unwrap();
        let network = InProcessNetwork::new();
        let core = ClusterCore::open(
            ClusterCoreConfig {
                identity: identity.clone(),
                data_dir: None,
                settings: ClusterSettings::default(),
            },
            network.transport(&identity),
        )
        .unwrap();

        let path = temp_socket();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(start(core.routes(), path.clone(), cancel.clone()));

        // Wait for the listener.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let client = ClusterClient::new(&path);
        let (view, _) = client.server().await.unwrap();
        assert_eq!(view.auth, "trusted");
        assert_eq!(
            client.member_urls().await.unwrap(),
            vec!["/1.0/cluster/members/none".to_string()]
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
