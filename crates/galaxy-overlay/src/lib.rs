//! Node Membership for the Galaxy Satellite
//!
//! The overlay is the satellite's view of the storage node fleet: who exists,
//! where they are, how they have behaved, and which of them to hand to an
//! uplink for the next upload.
//!
//! - **service**: check-ins, reputation updates, exit status, node events
//! - **db**: SQLite persistence for dossiers and the event log
//! - **selection**: ByID and BySubnet sampling with placement and country
//!   filters
//! - **cache**: the upload-selection snapshot, so hot-path selection never
//!   touches the database

pub mod cache;
pub mod db;
pub mod error;
pub mod selection;
pub mod service;
pub mod types;

pub use cache::{CacheConfig, UploadSelectionCache};
pub use db::OverlayDb;
pub use error::{Error, Result};
pub use selection::{NodeFilters, SelectById, SelectBySubnet};
pub use service::{Config, Service};
pub use types::{
    ExitStatusRequest, NodeCheckIn, NodeDossier, NodeEvent, NodeEventKind, ReputationStatus,
    SelectedNode,
};
