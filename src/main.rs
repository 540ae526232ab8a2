use collab_hub::{HubServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    log::info!("Starting collaboration hub on {}", config.bind_addr);

    let server = HubServer::new(config);
    server.run().await?;
    Ok(())
}
