//! Types shared by the orchestration server and its clients.
//!
//! - [`model`]: identifiers, lobby slots, matches, room and tournament snapshots
//! - [`bracket`]: single-elimination pool seeding, pairing and winner resolution
//! - [`protocol`]: the closed wire taxonomy and its bincode codec
//! - [`view`]: the client replica that applies live and replayed events

pub mod bracket;
pub mod model;
pub mod protocol;
pub mod view;

pub use bracket::{pair_slots, resolve_winner, Bracket, BracketError, Slot};
pub use model::{
    ClientId, Countdown, Identity, Match, MatchId, MatchState, Participant, PlayerSlot, Role,
    RoomConfig, RoomSnapshot, RoomStatus, RoomSummary, SessionId, TournamentId,
    TournamentSnapshot, TournamentStatus, UserId,
};
pub use protocol::{
    ClientMessage, Envelope, ErrorCode, ErrorPayload, ServerEvent, ServerMessage, SessionStart,
    Topic, PROTOCOL_VERSION,
};
pub use view::ClientView;
