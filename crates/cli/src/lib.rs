//! Event relay binary support: settings loading, observability wiring and the
//! composition root. `main.rs` only sequences these.

pub mod observability;
pub mod relay_app;
pub mod settings;

pub use relay_app::Relay;
pub use settings::RelaySettings;
