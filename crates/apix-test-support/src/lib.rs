mod in_memory_storage;
mod mock_webhook_server;
mod mock_ws_client;

pub use in_memory_storage::InMemoryStorage;
pub use mock_webhook_server::{MockWebhookServer, ReceivedDelivery};
pub use mock_ws_client::MockWsClient;
