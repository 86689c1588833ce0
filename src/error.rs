// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_enum::TryFromPrimitiveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too small: {0}")]
    TooSmall(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("no marker")]
    NoMarker,

    #[error("invalid message type {0}")]
    InvalidMessageType(u8),

    #[error("bad version")]
    BadVersion,

    #[error("unsupported {0}")]
    Unsupported(String),

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send {0}")]
    ChannelSend(String),

    #[error("channel connect error")]
    ChannelConnect,

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("attempt to send a message when not connected")]
    NotConnected,

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("internal communication error {0}")]
    InternalCommunication(String),

    #[error("error code")]
    ErrorCode(#[from] TryFromPrimitiveError<crate::messages::ErrorCode>),

    #[error("optional parameter code error")]
    OptionalParameterCode(
        #[from] TryFromPrimitiveError<crate::messages::OptionalParameterCode>,
    ),
}
