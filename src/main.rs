use std::sync::Arc;

use streamdeck_hass_plugin::{
    config::{self, LaunchArgs, PluginConfig, TOKEN_ENV},
    settings::SharedVariables,
    streamdeck::Backlog,
    HomeAssistantPlugin, HubClient, PluginSession, SvgIconRenderer,
};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "HASS_DECK_LOG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = LaunchArgs::parse_host_args(std::env::args_os()).unwrap_or_else(|e| e.exit());
    let file = match &args.config {
        Some(path) => config::load_config(path)?,
        None => PluginConfig::default(),
    }
    .with_token_override(std::env::var(TOKEN_ENV).ok());

    let deck = PluginSession::with_long_press(args.registration()?, file.long_press());

    // Buttons announce themselves right after registration, before the hub
    // settings are known; hold those announcements until the plugin listens.
    let backlog = Backlog::record(deck.events());

    let deck_task = deck.connect().await?;
    let global = deck.get_global_settings().await?;

    let hub = HubClient::new(file.hub_config(&global)?)?;
    let renderer = Arc::new(SvgIconRenderer::new(file.icon_size, file.background.clone()));
    let plugin = HomeAssistantPlugin::new(deck.clone(), hub.clone(), renderer);
    plugin.restore_shared_variables(SharedVariables::from_global_settings(&global));
    plugin.attach();

    let replayed = backlog.replay();

    let hub_task = hub.start();
    tracing::info!(url = %hub.url(), replayed, "Plugin running");

    tokio::select! {
        _ = deck_task => tracing::info!("Stream Deck connection ended, shutting down"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
    }

    plugin.detach();
    hub.close();
    let _ = hub_task.await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
