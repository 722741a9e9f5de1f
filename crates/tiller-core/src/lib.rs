pub mod agent;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod event_stream;
pub mod file_store;
pub mod security;
pub mod state;
pub mod storage_paths;

pub use agent::*;
pub use config::*;
pub use controller::*;
pub use conversation::*;
pub use event_stream::*;
pub use file_store::*;
pub use security::*;
pub use state::*;
pub use storage_paths::*;

use tiller_types::Event;

#[async_trait::async_trait]
impl tiller_runtime::EventLog for EventStream {
    async fn events(&self) -> Vec<Event> {
        self.get_events(0, None, None).await
    }
}
