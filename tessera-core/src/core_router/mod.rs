pub mod codes;
pub mod dial_history;
pub mod envelope;
pub mod errors;
pub mod identify;
pub mod join;
pub mod key_tables;
pub mod messages;
pub mod padding;
pub mod peer;
pub mod peer_registry;
pub mod router;
pub mod transport;

pub use codes::{CodeType, JoinAckOp, JoinOp, OpType};
pub use dial_history::{DialEntry, DialHistory};
pub use envelope::{decrypt, encrypt, marshal, unmarshal, Decoded};
pub use errors::{AdmissionError, CodecError, ErrorClass, RouterError, RouterResult, TransportError};
pub use identify::{IdentifySession, IdentifyState};
pub use join::{ConfirmJoin, JoinRequest, JoinState};
pub use key_tables::{KeyEntry, KeyTables};
pub use peer::{Outbound, Peer};
pub use peer_registry::{PeerInfo, PeerRegistry};
pub use router::{NodeInfo, Router};
pub use transport::{MemoryTransport, Transport};
