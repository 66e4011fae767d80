pub mod arbiter;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod display;
pub mod error;
pub mod health;
pub mod hub;
pub mod ingest;
pub mod logging;
pub mod media;
pub mod protocol;
pub mod scheduler;
pub mod selection;
pub mod server;
pub mod watcher;
pub mod web;

pub mod state {
    use crate::{config::ConfigManager, server::InboundEvent, server::WallServer};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Clone)]
    pub struct AppState {
        pub config: Arc<ConfigManager>,
        pub server: Arc<WallServer>,
        pub inbound: mpsc::Sender<InboundEvent>,
    }
}
