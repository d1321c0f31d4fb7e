pub mod connectivity_probe;
pub mod db;
pub mod local_storage;
pub mod notifier;
pub mod provider_http;

pub use connectivity_probe::ConnectivityProbe;
pub use db::PgStore;
pub use local_storage::FileStorage;
pub use notifier::TracingNotifier;
pub use provider_http::HttpProviderApi;
