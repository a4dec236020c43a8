//! meshwire runtime core.
//!
//! The distribution engine of the meshwire framework: channels, sequenced
//! delta-compressed transport, the shared object tree, event dispatch,
//! reset replay, the query overlay and lossless acknowledgment.
//!
//! Applications interact through [`runtime::Runtime`]: register types,
//! declare produced/consumed sets, start, attach channels, then create,
//! mutate and commit objects. Everything else in this crate serves that
//! surface.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handler;
pub mod hub;
pub mod import;
pub mod moderator;
pub mod node_table;
pub mod object;
pub mod query;
pub mod registry;
pub mod resetter;
pub mod runtime;
pub mod sequencer;
pub mod stats;
pub mod transport;
pub mod tree;

pub use channel::{BackupMode, ChannelConfig, ChannelEvent, ChannelHandle};
pub use config::Config;
pub use error::CoreError;
pub use hub::{ForMe, Peer, PeerState};
pub use object::DataObject;
pub use query::{QueryObject, QueryReply, QueryState};
pub use registry::{DefaultBehavior, ObjectBehavior, TypeRegistry, TypeSpec};
pub use runtime::{Runtime, RuntimeBuilder};
pub use transport::{BoxTransport, Connector, FnConnector, OnceConnector, Transport};
pub use tree::{ObjectFilter, ObjectTree, TreeNode, TreeUpdate};
