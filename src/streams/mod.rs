//! Chain observer access: HTTP API, event hub and the big-map scanner.
//!
//! [`tzkt::TzktClient`] pages historical data, [`events::EventsClient`]
//! follows the live hub, and [`scanner::Scanner`] stitches both into an
//! ordered stream of whole-level messages.

pub mod events;
pub mod scanner;
pub mod tzkt;

pub use events::{Channel, Event, EventStream, EventsClient, Subscription};
pub use scanner::{Scanner, ScannerChannels};
pub use tzkt::{BigMapFilter, TzktClient};
