// Roomsync - Collaborative Document Sync Relay
//
// Demo: two providers on one host share a room through an in-process
// server, with the local broadcast relay carrying updates between them
// even before the network round-trip completes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use roomsync::provider::relay::LocalBus;
use roomsync::{
    CollabServer, Document, LoopbackTransport, ProviderConfig, ServerConfig, SyncProvider,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let server = CollabServer::new(ServerConfig::default());
    let transport = LoopbackTransport::new(server.clone());
    let bus = LocalBus::new();

    let config = |bus: &Arc<LocalBus>| ProviderConfig {
        auto_connect: false,
        resync_interval: Some(Duration::from_secs(5)),
        local_relay: Some(bus.clone()),
        ..Default::default()
    };

    let alice = SyncProvider::new(
        "ws://localhost:1234",
        "demo-room",
        Document::new("demo-room"),
        transport.clone(),
        config(&bus),
    );
    let bob = SyncProvider::new(
        "ws://localhost:1234",
        "demo-room",
        Document::new("demo-room"),
        transport,
        config(&bus),
    );

    alice.connect().await?;
    bob.connect().await?;

    alice.doc().write(b"hello from alice".to_vec());
    alice.doc().set_presence(Some(json!({"name": "alice", "cursor": 16})));
    bob.doc().write(b"hello from bob".to_vec());
    bob.doc().set_presence(Some(json!({"name": "bob", "cursor": 14})));

    // Let the relays settle.
    for _ in 0..100 {
        if alice.doc().state_hash() == bob.doc().state_hash()
            && alice.doc().presence_states().len() == 2
            && bob.doc().presence_states().len() == 2
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    println!("synced: alice={} bob={}", alice.synced(), bob.synced());
    println!(
        "converged: {}",
        alice.doc().state_hash() == bob.doc().state_hash()
    );
    for (client, state) in alice.doc().presence_states() {
        println!("presence {}: {}", client, state);
    }

    alice.destroy();
    bob.destroy();
    Ok(())
}
