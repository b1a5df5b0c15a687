//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::net::TcpListener;

use couchlite_listener::config::ServerConfig;
use couchlite_listener::net::Listener;
use couchlite_listener::store::{
    DatabaseManager, MemoryDatabase, MemoryReplicator, MemoryStore, Replicator,
};
use couchlite_listener::{ListenerServer, ListenerState};

/// A listener running on an ephemeral local port.
pub struct TestListener {
    pub addr: SocketAddr,
    pub state: ListenerState,
    pub store: Arc<MemoryStore>,
    pub client: reqwest::Client,
    server: tokio::task::JoinHandle<()>,
}

impl TestListener {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        self.store.memory_database(name).unwrap()
    }

    pub async fn get_json(&self, path: &str) -> (u16, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    pub async fn put_json(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self.client.put(self.url(path)).json(&body).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    pub async fn post_json(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Trigger shutdown and wait for the server task to finish.
    pub async fn stop(self) {
        self.state.shutdown.trigger();
        let _ = self.server.await;
    }
}

/// Config with the given databases pre-created.
pub fn config_with(databases: &[&str]) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.databases = databases.iter().map(|s| s.to_string()).collect();
    config.shutdown.drain_timeout_secs = 2;
    config
}

/// Start a listener backed by a fresh in-memory store.
pub async fn start_listener(config: ServerConfig) -> TestListener {
    let store = Arc::new(MemoryStore::with_databases(&config.databases).unwrap());
    let manager: Arc<dyn DatabaseManager> = store.clone();
    let replicator: Arc<dyn Replicator> = Arc::new(MemoryReplicator::new(manager.clone()));
    let max = config.listener.max_connections;
    let live = Arc::new(ArcSwap::from_pointee(config));
    let state = ListenerState::new(live, manager, replicator).unwrap();

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tcp(tcp, max);
    let addr = listener.local_addr().unwrap();

    let server = ListenerServer::new(state.clone());
    let server = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    TestListener {
        addr,
        state,
        store,
        client,
        server,
    }
}
