mod advancer;
mod broadcaster;
mod clock;
mod config;
mod controller;
mod error;
mod event;
mod instance;
mod server;
mod snapshot;
mod users;
mod validator;
mod websocket;

use dotset::DotSet;
use playset::registry::PlaysetRegistry;
use server::Server;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use users::UserStore;

const CONFIG_PATH: &str = "relay-config.json";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true),
        )
        .init();

    let config = config::load(Path::new(CONFIG_PATH)).await.unwrap_or_else(|err| {
        tracing::error!(?err, "failed to load config, falling back to defaults");
        config::ServerConfig::default()
    });

    let snapshot = match snapshot::load(&config.snapshot_path) {
        Ok(snapshot) => Some(snapshot),
        Err(error::SnapshotError::Io(io)) if io.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            tracing::error!(?err, "failed to parse existing snapshot, starting fresh");
            None
        }
    };

    let mut playsets = PlaysetRegistry::new();
    playsets.register(Arc::new(DotSet::new()));

    let (users, next_controller_id) = match &snapshot {
        Some(s) => (UserStore::new(s.users.clone().into_iter().collect()), s.next_controller_id),
        None => (UserStore::new(Default::default()), 1),
    };

    let listen_addr = config.listen_addr.clone();
    let instance_roster: BTreeSet<String> = config
        .instances
        .keys()
        .cloned()
        .chain(snapshot.as_ref().map(|s| s.instances.keys().cloned().collect()).unwrap_or_default())
        .collect();

    let server = Server::new(users, playsets, config, next_controller_id);

    for name in instance_roster {
        let instance_snapshot = snapshot.as_ref().and_then(|s| s.instances.get(&name).cloned());
        let playset_name = server
            .config
            .read()
            .await
            .instances
            .get(&name)
            .cloned()
            .or_else(|| instance_snapshot.as_ref().map(|s| s.playset_name.clone()))
            .unwrap_or_else(|| "dotset".to_string());

        if let Err(err) = server.spawn_instance(name.clone(), &playset_name, instance_snapshot).await {
            tracing::error!(instance = %name, ?err, "failed to spawn instance at startup");
        }
    }

    let app = websocket::router(server);

    let addr: SocketAddr = listen_addr.parse().unwrap_or_else(|err| {
        tracing::error!(?err, listen_addr, "invalid listen_addr, falling back to 0.0.0.0:9001");
        "0.0.0.0:9001".parse().unwrap()
    });

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listen address");
    tracing::info!(%addr, "relay server listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await.expect("server loop exited");
}
