use std::sync::Arc;

use tiller_core::ConversationManager;

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConversationManager>,
}

impl AppState {
    pub fn new(manager: Arc<ConversationManager>) -> Self {
        Self { manager }
    }
}
