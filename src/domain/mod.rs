pub mod board;
pub mod card;
pub mod error;
pub mod event;
pub mod stage;

pub use board::{Board, BoardFilters, BoardQuery, Column};
pub use card::{Card, MoveIntent};
pub use error::PipelineError;
pub use event::{RemoteChange, RemoteChangeEvent, RemoteEventKind};
pub use stage::{Stage, StageId, StageModel};
