pub mod error;
pub mod http_remote_store;
pub mod in_memory_remote_store;
pub mod remote_store;

pub use error::{RepositoryError, RepositoryResult};
pub use http_remote_store::HttpRemoteStore;
pub use in_memory_remote_store::{Failure, InMemoryRemoteStore, Operation};
pub use remote_store::{
    BoxFuture, ConversationPatch, ConversationRecord, MessageMetadata, MessagePayload, NewRun,
    Page, PageQuery, RemoteFeedback, RemoteStore, RunPatch, RunRecord, RunRepository,
    StoredMessage, collect_pages,
};
