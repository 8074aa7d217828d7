pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod protocol;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;
pub mod task;
pub mod telemetry;

pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use gateway::{Backend, Gateway, MockBackend};
pub use protocol::{ChatMessage, MessageRole, Provider, TaskKind, TaskStatus};
pub use session::{ProviderKeys, Session, SessionHandle};
pub use state::ClientState;
pub use store::SnapshotStore;
pub use stream::StreamChunk;
pub use task::{Followup, Task, TaskOrchestrator};
