//! Direct Connect peer-to-peer client library.
//!
//! This crate is a thin umbrella over the workspace members, each of which
//! implements one component of the client:
//!
//! * [`tigerhub_common`] — shared data model, configuration, errors, TTH.
//! * [`tigerhub_proto`] — the NMDC/ADC wire codec.
//! * [`tigerhub_net`] — transport-agnostic connection traits.
//! * [`tigerhub_net_threaded`] — a thread-per-connection transport.
//! * [`tigerhub_fsm`] — the hub session, peer connection, transfer and search engines.
//! * [`tigerhub_client`] — the public [`Client`] that owns everything above.

#[cfg(feature = "tigerhub-common")]
pub use tigerhub_common as common;

#[cfg(feature = "tigerhub-proto")]
pub use tigerhub_proto as proto;

#[cfg(feature = "tigerhub-net")]
pub use tigerhub_net as net;

#[cfg(feature = "tigerhub-net-threaded")]
pub use tigerhub_net_threaded as net_threaded;

#[cfg(feature = "tigerhub-fsm")]
pub use tigerhub_fsm as fsm;

#[cfg(feature = "tigerhub-client")]
pub use tigerhub_client::{self as client, Client};
