//! Event relay configuration repositories.
//!
//! Implements [`relay::ConfigurationRepository`] twice over the same
//! [`ConfigurationDocument`]:
//!
//! - [`InMemoryConfigurationRepository`] keeps the document in memory.
//! - [`JsonFileConfigurationRepository`] re-reads a JSON file on every call
//!   and writes changes back atomically.
//!
//! Neither adds claiming or locking around catch-up jobs; a relay process
//! treats whatever `get_next_catchup_subscription_configuration` returns as
//! its own.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Storage format and file handling live here.

mod document;
mod file;
mod memory;

pub use document::ConfigurationDocument;
pub use file::JsonFileConfigurationRepository;
pub use memory::InMemoryConfigurationRepository;
