use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use room_chat::moderation::{Classifier, PassthroughClassifier};
use room_chat::server::handle_rejection;
use room_chat::store::{MemoryStore, SqliteStore, Store};
use room_chat::{load_config, routes, tls, Server};
use warp::Filter;

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "room_chat.toml".to_string());
    let config = match load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {config_path}: {e}");
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .parse_filters(&config.logging.level)
        .parse_default_env()
        .init();

    let store: Arc<dyn Store> = match &config.storage.path {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => {
                info!("Using SQLite store at {}", path);
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to open database {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => {
            warn!("No storage path configured, messages are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let classifier: Arc<dyn Classifier> = Arc::new(PassthroughClassifier);
    let server = Arc::new(Server::new(store, &config, Some(classifier)));

    let routes = routes(server)
        .recover(handle_rejection)
        .with(warp::cors().allow_any_origin())
        .with(warp::log("room_chat::http"));

    let addr = SocketAddr::new(config.server.host, config.server.port);
    match &config.server.tls {
        Some(tls_config) => match tls::load_tls_material(tls_config) {
            Ok(material) => {
                info!("Starting secure server (HTTPS/WSS) on {}", addr);
                warp::serve(routes)
                    .tls()
                    .cert(material.cert_pem)
                    .key(material.key_pem)
                    .run(addr)
                    .await;
            }
            Err(e) => {
                warn!("Failed to load TLS material ({}), falling back to HTTP/WS on {}", e, addr);
                warp::serve(routes).run(addr).await;
            }
        },
        None => {
            info!("Starting server (HTTP/WS) on {}", addr);
            warp::serve(routes).run(addr).await;
        }
    }
}
