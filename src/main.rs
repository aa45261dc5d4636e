use std::path::PathBuf;
use std::sync::Arc;

use chatcodes_server::config::{Config, ConfigError, StoreCredentials};
use chatcodes_server::server::Server;
use chatcodes_server::store::{DocumentStore, MemoryStore};
use clap::Parser;
use log::{error, info, warn};
use warp::Filter;

fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>, ConfigError> {
    if config.use_persistent_store {
        let credentials = StoreCredentials::load(&config.credentials)?;
        warn!(
            "Persistent store at {} requested, but this build only has the in-memory store",
            credentials.url
        );
    }
    Ok(Arc::new(MemoryStore::new()))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let server = Server::new(store, config.idle_delay());

    let ws_route = warp::path::end()
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = server.clone();
            ws.on_upgrade(move |socket| server.handle_connection(socket))
        });

    let index: PathBuf = config.static_dir.join("index.html");
    let channel_page = warp::path::param::<String>()
        .and(warp::path::end())
        .and(warp::fs::file(index))
        .map(|_channel: String, file: warp::fs::File| file);

    let static_files = warp::fs::dir(config.static_dir.clone());

    let routes = ws_route
        .or(static_files)
        .or(channel_page)
        .with(warp::cors().allow_any_origin());

    info!("Created channel server on port {}", config.port);
    warp::serve(routes).run(([0, 0, 0, 0], config.port)).await;
}
