//! HTTP server command (`fireside serve`).

use anyhow::Result;

use fireside::config::PortalConfig;

pub async fn cmd_serve(
    mut config: PortalConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if dev {
        config.server.dev_mode = true;
    }

    fireside::portal::server::start_server(config).await
}
