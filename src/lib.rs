pub mod client;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use client::{Evt800, Evt800Builder, ReportCallback};
pub use error::{ClientError, Result};
pub use telemetry::{ChannelReport, TelemetryReport};
