//! Tidepool Protocol Server
//!
//! Session-level state machine for collaborative branch editing. Connected
//! devices watch branches, push CRDT update fragments, observe each
//! other's presence, and receive webhook deliveries. Storage goes through
//! the split store from `tidepool-store`; message delivery goes through a
//! pluggable [`Messenger`]; connection tracking goes through a pluggable
//! [`ConnectionStore`].

pub mod connections;
pub mod error;
pub mod messages;
pub mod messenger;
pub mod server;

pub use connections::{
    ConnectionInfo, ConnectionStore, MemoryConnectionStore, NamespaceEntry, NamespaceKind,
};
pub use error::{Result, ServerError};
pub use messages::{
    AddAtomsMessage, AddUpdatesMessage, BranchProtocol, EventTarget, ProtocolMessage,
    RemoteAction, SendEventRequest, TimeSample, UpdateRejection, UpdatesReceivedMessage,
    WatchBranchRequest,
};
pub use messenger::{MemoryMessenger, Messenger, SentMessage};
pub use server::{ProtocolServer, ServerConfig};
