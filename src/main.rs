use liveboard::{Config, Server, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("LIVEBOARD_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("LIVEBOARD_DATA") {
        config.store.path = path.into();
    }

    let server = match Server::new(config, Config::default()) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to open store: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        log::error!("server error: {e}");
        std::process::exit(1);
    }
}
