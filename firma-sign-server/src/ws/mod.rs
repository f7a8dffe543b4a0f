//! WebSocket gateway: authenticated subscription channels fed by the
//! internal event bus.

pub mod auth;
pub mod clients;
pub mod gateway;

pub use auth::{JwtVerifier, SessionValidator, StaticSessionValidator};
pub use gateway::Gateway;
