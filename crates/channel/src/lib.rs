pub mod error;
pub mod model;
pub mod service;

pub use error::ChannelError;
pub use model::{CID_CHARS, CLIENT_ID_LEN, Channel, valid_client_id};
pub use service::{ChannelConfig, ChannelService, GetOutcome, ReportOutcome};
