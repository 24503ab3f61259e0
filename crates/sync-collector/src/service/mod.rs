//! Service Layer
//!
//! - `CollectorFilters`: filters received from peers, per store
//! - `SenderFilters`: filters advertised to peers, per store
//! - `ContentFetcher`: the per-store collection loop
//! - `CollectorService`: store registry implementing `CollectorApi`

pub mod collector_filters;
pub mod collector_service;
pub mod content_fetcher;
pub mod sender_filters;

pub use collector_filters::CollectorFilters;
pub use collector_service::{CollectorService, StoreCollector};
pub use content_fetcher::{ContentFetcher, FetcherDeps};
pub use sender_filters::{OutgoingFilter, SenderFilters};
