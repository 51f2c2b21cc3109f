//! Live register monitor fed by the push server.

pub mod client;
pub mod model;
pub mod protocol;
pub mod state;

pub use client::{ConnectionState, RealtimeClient, RealtimeSettings};
pub use model::{RegisterState, RegisterStatus, RegisterUpdate, SalePreview};
pub use state::{LiveState, RegisterEffect, DEFAULT_FEED_CAPACITY};
