//! # Per-connection link-layer algorithms
//!
//! Small state machines attached to each connection: channel hopping,
//! stop-and-wait ARQ, credit flow control, clear channel assessment,
//! random datarate offset, fallback, connect status, link quality
//! statistics, gain loop, phase acquisition, the link protocol header
//! codec, the TDMA scheduler and synchronization, and the distributed
//! desync mechanism.

pub mod cca;
pub mod channel_hopping;
pub mod connect_status;
pub mod credit_flow_ctrl;
pub mod ddcm;
pub mod fallback;
pub mod gain_loop;
pub mod lqi;
pub mod phase;
pub mod protocol;
pub mod rdo;
pub mod saw_arq;
pub mod scheduler;
pub mod tdma_sync;
