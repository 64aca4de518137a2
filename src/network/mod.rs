//! Network Layer
//!
//! WebSocket server, identity binding and the per-match actors.
//! This layer is **non-deterministic**; all game logic runs through `game/`.

pub mod actor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use actor::{MatchActor, MatchCommand, MatchHandle, Outbox};
pub use protocol::{ClientMessage, ErrorCode, MatchSnapshot, SeatView, ServerError, ServerMessage};
pub use registry::{MatchRegistry, RegistryError};
pub use server::{GameServer, GameServerError};
pub use session::{ConnectionId, IdentityManager, ReconnectToken, Redeemed, SessionError};
