// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::Asn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Per-peer configuration. Timer fields deliberately carry their units in
/// the name: hold and connect retry are negotiated/exchanged in whole
/// seconds on the wire, while the idle hold backoff is managed internally
/// at millisecond granularity.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct PeerConfig {
    pub name: String,

    /// Address the peer connects from and that we connect out to.
    pub host: SocketAddr,

    /// ASN the peer is required to present in its OPEN. None accepts any.
    pub remote_asn: Option<u32>,

    /// Hold time proposed in our OPEN, in seconds.
    pub hold_time: u64,

    /// Initial idle hold (damping) interval, in milliseconds. Zero disables
    /// damping and the peer leaves idle immediately.
    pub idle_hold_time: u64,

    /// Interval between outbound connection attempts, in seconds.
    pub connect_retry: u64,

    /// How long to wait for a passive connection to produce an OPEN before
    /// we send ours, in seconds.
    pub open_time: u64,

    /// Timer tick resolution, in milliseconds.
    pub resolution: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub asn: Asn,
    pub id: u32,
}
