pub mod ids;
pub mod marker;
pub mod wire;

pub use ids::{CollectionId, IndexId, ServerId, Tick, TransactionId};
pub use marker::{decode_markers, Marker};
pub use wire::{
    FollowLogResponse, HttpWireClient, MasterInfo, OpenTransactionsResponse, WireClient, WireError,
};
