//! Session Module - Zustandsmaschine eines Anrufs
//!
//! ```text
//! Idle --start_call/accept_incoming_call--> Connecting
//! Connecting --Answer angenommen + Media verbunden--> Connected
//! Connecting --Ablehnung/Ende/Fehler/Timeout--> Ended | Error
//! Connected --end_call/Ende vom Peer/Media-Fehler--> Ended | Error
//! (Ended, Error) --neuer Anruf--> Connecting
//! ```
//!
//! Es gibt immer höchstens eine aktive Session.

mod actor;
mod manager;
mod state;

pub use manager::{CallSessionManager, SessionDeps};
pub use state::{reason, CallId, CallSession, CallState, IncomingCall, Peer, SessionEvent};
