//! WebSocket gateway: connection acceptance, session lifecycle, and the
//! backoff policy applied to recoverable session-run failures.

pub mod config;
pub mod demo;
pub mod retry;
pub mod server;
pub mod session;
pub mod transport;

pub use config::GatewayConfig;
pub use demo::DemoSessionFactory;
pub use server::WebSocketServer;
pub use session::{AgentSession, SessionFactory};
pub use transport::WsTransport;
