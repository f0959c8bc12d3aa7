// Carmen live state
// Composes indexes, stores, depots, and the slot multimap into the current
// world state, with schema variants, open-time configuration, and read-only
// views into the archive.

pub mod config;
pub mod historic;
pub mod live;
pub mod mpt;

pub use config::{open_state, ArchiveImpl, Schema, StateImpl};
pub use historic::HistoricView;
pub use live::{Schema1State, Schema3State, SlotIdPair, SlotKey, SlotValue, State};
pub use mpt::MptState;
