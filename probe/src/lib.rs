pub mod config;
pub mod http;
pub mod provider;
pub mod types;
pub mod websocket;

pub use config::ProbeConfig;
pub use http::{HttpProbe, HEALTH_PATH};
pub use provider::{Probe, ProbeError, ProbeResult};
pub use types::{LoginRequest, Method, ProbeRequest, ProbeResponse, TokenGrant};
pub use websocket::WebSocketProbe;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::http::*;
    pub use crate::provider::*;
    pub use crate::types::*;
    pub use crate::websocket::*;
}
