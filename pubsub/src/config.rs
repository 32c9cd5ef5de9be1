use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::pool::PubSubPoolAdapter`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PubSubConfig {
    pub project_id: String,
    pub subscription: String,
}

impl Default for PubSubConfig {
    fn default() -> PubSubConfig {
        PubSubConfig {
            project_id: String::new(),
            subscription: String::new(),
        }
    }
}
