//! Client for the Diagral alarm cloud API.

mod client;
mod error;
pub mod models;
pub mod notification;
pub mod signing;

pub use client::ClientConfig;
pub use client::DEFAULT_BASE_URL;
pub use client::DiagralApi;
pub use client::DiagralClient;
pub use client::Result;
pub use error::DiagralError;
pub use models::*;
pub use notification::AlarmType;
pub use notification::WebhookNotification;
