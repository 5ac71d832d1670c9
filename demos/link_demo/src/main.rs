// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Minimal demonstration of wiring `link_core` to the `mqtt_transport` adapter.
//!
//! Configures a single link to a peer named by `PEER_LINK_NAME`, starts the core, and logs
//! every state change until the process is interrupted. Not unit-tested beyond compiling;
//! see the façade's own tests in `link_core` for end-to-end coverage.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use link_core::{Core, CoreConfigBuilder, LinkConfigBuilder};
use mqtt_transport::MqttConnectionSettingsBuilder;
use tokio::signal;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .init();

    let peer_link_name = env::var("PEER_LINK_NAME").unwrap_or_else(|_| "peer-a".to_string());
    let ingress_topic = format!("scada/{peer_link_name}/inbound");
    let egress_topic = format!("scada/{peer_link_name}/outbound");

    let link = LinkConfigBuilder::default()
        .name(peer_link_name.clone())
        .ingress_topics(vec![ingress_topic.clone()])
        .egress_topic(egress_topic)
        .build()
        .expect("link configuration is valid");

    let config = CoreConfigBuilder::default()
        .links(vec![link])
        .journal_dir(PathBuf::from("./link-journal"))
        .build()
        .expect("core configuration is valid");

    let connection_settings = MqttConnectionSettingsBuilder::from_environment()
        .expect("environment variables are well formed")
        .build()
        .expect("connection settings are valid");

    let transport_factory: link_core::TransportFactory = Arc::new(move |_link_config| {
        let (client, event_loop) =
            mqtt_transport::connect(connection_settings.clone(), 64).expect("mqtt options valid");
        (
            Arc::new(client) as Arc<dyn link_core::transport::TransportClient>,
            Box::new(event_loop) as Box<dyn link_core::transport::TransportEventLoop>,
        )
    });

    // Any non-empty payload counts as evidence the peer is alive. A real application would
    // parse its own message schema here instead.
    let validator: link_core::MessageValidator = Arc::new(|_topic, payload| !payload.is_empty());

    let core = Core::start(config, transport_factory, validator)
        .await
        .expect("core starts");

    let mut state_changes = core.subscribe_state_changes();
    tokio::spawn(async move {
        while let Ok(change) = state_changes.recv().await {
            log::info!(
                "link {} transitioned {:?} -> {:?} ({:?})",
                change.link,
                change.from,
                change.to,
                change.reason
            );
        }
    });

    log::info!("core started for link {peer_link_name}, waiting for shutdown signal");
    signal::ctrl_c().await.expect("ctrl-c handler installs");

    log::info!("shutting down");
    tokio::time::timeout(Duration::from_secs(10), core.stop())
        .await
        .ok();
}
