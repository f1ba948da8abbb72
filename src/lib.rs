//! Inbound webhook receivers that turn provider notifications into targeted
//! Warehouse refreshes.
//!
//! A request flows through one [`receivers::Receiver`]: it is authenticated,
//! normalized into a [`types::NormalizedSignal`] (or evaluated against
//! declarative rules), and handed to the [`refresh::Refresher`], which
//! decides which Warehouses to refresh and aggregates the outcome.

pub mod app;
pub mod conditions;
pub mod config;
pub mod error;
pub mod expr;
pub mod http_server;
pub mod qualifiers;
pub mod receivers;
pub mod refresh;
pub mod secrets;
pub mod selector;
pub mod store;
pub mod types;
pub mod urls;
pub mod verification;

pub use app::App;
pub use receivers::{Receiver, Registry, WebhookRequest, WebhookResponse};
pub use refresh::Refresher;
