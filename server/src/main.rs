//! Standalone `broker-server` binary: wires a `SessionBroker` — host-PTY spawner, no container
//! runtime by default, an env-seeded identity provider — to the Axum transport and runs it.
//!
//! `IdentityProvider` is an external collaborator the core only consumes (spec §1); this binary
//! supplies the simplest possible binding (`BROKER_TOKENS=token:user,token2:user2`) rather than a
//! real auth service, since registration/OAuth/tables are explicitly out of the broker's scope.

use std::net::SocketAddr;
use std::sync::Arc;

use broker_core::broker::SessionBroker;
use broker_core::collaborators::StaticIdentityProvider;
use broker_core::config::BrokerConfig;
use broker_core::pty::host::DefaultPtySpawner;
use broker_server::{run_web_server, AppState};

const DEFAULT_PORT: u16 = 7880;

fn identity_provider_from_env() -> StaticIdentityProvider {
    let mut provider = StaticIdentityProvider::new();
    if let Ok(raw) = std::env::var("BROKER_TOKENS") {
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once(':') {
                Some((token, user)) => provider = provider.with_token(token.trim(), user.trim()),
                None => tracing::warn!(entry = %pair, "ignoring malformed BROKER_TOKENS entry"),
            }
        }
    }
    provider
}

fn main() -> anyhow::Result<()> {
    let config = BrokerConfig::from_env();
    broker_core::logging::init(config.log_level);

    let port: u16 = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    if config.container_mode {
        tracing::warn!(
            "BROKER_CONTAINER_MODE is set but this binary wires no ContainerRuntime; every create_session call will fail with Unavailable"
        );
    }

    let pty_grace = config.pty_grace;
    let broker = SessionBroker::new(config, Arc::new(DefaultPtySpawner { pty_grace }), None);
    broker.start_background_tasks();

    let identity = Arc::new(identity_provider_from_env());
    let state = AppState { broker, identity };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_web_server(addr, state)).map_err(|e| anyhow::anyhow!(e))
}
