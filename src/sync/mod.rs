pub mod board_store;
pub mod channel;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod session;
pub mod validator;

pub use board_store::BoardStore;
pub use channel::{ChannelConfig, ChannelNotice, ChannelState, RealtimeChannel};
pub use controller::{CardPhase, MoveOutcome, ReconciliationController, RemoteOutcome, SyncNotice};
pub use error::{GatewayError, SyncError};
pub use gateway::{BoardSource, CommandGateway, HttpGateway, SESSION_HEADER};
pub use session::SyncSession;
pub use validator::{Transition, TransitionValidator};
