//! AI model gateway.
//!
//! Every model the classifier consults (the two voters and the arbiter) is
//! reached through one [`ModelGateway`]. The HTTP implementation accepts any
//! of the response envelopes listed in [`ResponseShape`].
//!
//! # Example
//!
//! ```rust,no_run
//! use mailtriage::providers::ai::{HttpGateway, ModelGateway};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = HttpGateway::new("https://gateway.example.com", Some("key".into()));
//! if gateway.health_check().await {
//!     let text = gateway.generate("model-a", "Say hi as JSON").await?;
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

mod gateway;
mod response;
mod traits;

pub use gateway::HttpGateway;
pub use response::{extract_output, parse_json_payload, ResponseShape};
pub use traits::{LlmError, LlmResult, ModelGateway};

#[cfg(test)]
pub use traits::MockGateway;
