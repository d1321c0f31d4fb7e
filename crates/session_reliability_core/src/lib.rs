pub mod clock;
pub mod connectivity;
pub mod domain;
pub mod error;
pub mod memory;
pub mod ports;
pub mod practice;
pub mod provider;
pub mod queue;
pub mod quota;
pub mod retry;
pub mod session;

pub use clock::{Clock, SystemClock};
pub use connectivity::ConnectivityMonitor;
pub use domain::{
    CompletionResult, Conversation, Course, QueueItem, QueuedOperation, Session, SessionPatch,
    SessionStatus, Tier, User,
};
pub use error::{ErrorKind, SessionError, SessionResult};
pub use ports::{
    CourseCatalog, LocalStorage, NotificationLevel, Notifier, PortError, PortResult, ProviderApi,
    ProviderConfigSource, ProviderReply, SessionStore, TransportError, UsageStore,
};
pub use practice::{CompletionOutcome, PracticeSessions, StartOutcome};
pub use provider::ConversationClient;
pub use queue::{OfflineQueue, ProcessReport, QueueConfig, QueueDispatcher};
pub use quota::QuotaEnforcer;
pub use retry::RetryPolicy;
pub use session::SessionManager;
