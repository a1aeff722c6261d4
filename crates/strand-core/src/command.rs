//! Control-plane messages between a client and the driver.
//!
//! Commands travel client → driver on the to-driver ring, responses and
//! notifications travel driver → client on the to-clients ring. Both are
//! closed enums: a message type id that is not listed here is rejected by
//! the decoder, never guessed at.
//!
//! All fields are little-endian. Strings are an `i32` byte length followed
//! by UTF-8 bytes.
//!
//! ```text
//! command:  [client id i64][correlation id i64][kind-specific fields]
//! response: [correlation id i64][kind-specific fields]
//! ```

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Message type ids carried in the ring record header.
pub mod msg_type {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const REMOVE_PUBLICATION: i32 = 0x02;
    pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x03;
    pub const ADD_SUBSCRIPTION: i32 = 0x04;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
    pub const CLIENT_KEEPALIVE: i32 = 0x06;
    pub const CLIENT_CLOSE: i32 = 0x07;

    pub const ON_ERROR: i32 = 0x0F01;
    pub const ON_AVAILABLE_IMAGE: i32 = 0x0F02;
    pub const ON_PUBLICATION_READY: i32 = 0x0F03;
    pub const ON_OPERATION_SUCCESS: i32 = 0x0F04;
    pub const ON_UNAVAILABLE_IMAGE: i32 = 0x0F05;
    pub const ON_EXCLUSIVE_PUBLICATION_READY: i32 = 0x0F06;
    pub const ON_SUBSCRIPTION_READY: i32 = 0x0F07;
    pub const ON_CLIENT_TIMEOUT: i32 = 0x0F08;
}

/// Errors decoding a control-plane message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown message type {0:#06x}")]
    UnknownMessageType(i32),

    #[error("message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid string length {0}")]
    InvalidLength(i32),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// A lifecycle request from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddPublication { channel: String, stream_id: i32 },
    AddExclusivePublication { channel: String, stream_id: i32 },
    RemovePublication { registration_id: i64 },
    AddSubscription { channel: String, stream_id: i32 },
    RemoveSubscription { registration_id: i64 },
    ClientKeepalive,
    ClientClose,
}

impl Command {
    pub fn msg_type_id(&self) -> i32 {
        match self {
            Command::AddPublication { .. } => msg_type::ADD_PUBLICATION,
            Command::AddExclusivePublication { .. } => msg_type::ADD_EXCLUSIVE_PUBLICATION,
            Command::RemovePublication { .. } => msg_type::REMOVE_PUBLICATION,
            Command::AddSubscription { .. } => msg_type::ADD_SUBSCRIPTION,
            Command::RemoveSubscription { .. } => msg_type::REMOVE_SUBSCRIPTION,
            Command::ClientKeepalive => msg_type::CLIENT_KEEPALIVE,
            Command::ClientClose => msg_type::CLIENT_CLOSE,
        }
    }
}

/// A command together with its sender and correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub command: Command,
}

impl CommandMessage {
    #[inline]
    pub fn msg_type_id(&self) -> i32 {
        self.command.msg_type_id()
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_i64_le(self.client_id);
        dst.put_i64_le(self.correlation_id);
        match &self.command {
            Command::AddPublication { channel, stream_id }
            | Command::AddExclusivePublication { channel, stream_id }
            | Command::AddSubscription { channel, stream_id } => {
                dst.put_i32_le(*stream_id);
                put_string(dst, channel);
            }
            Command::RemovePublication { registration_id }
            | Command::RemoveSubscription { registration_id } => {
                dst.put_i64_le(*registration_id);
            }
            Command::ClientKeepalive | Command::ClientClose => {}
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }

    pub fn decode(msg_type_id: i32, mut src: &[u8]) -> Result<Self, CodecError> {
        let client_id = get_i64(&mut src)?;
        let correlation_id = get_i64(&mut src)?;
        let command = match msg_type_id {
            msg_type::ADD_PUBLICATION => {
                let stream_id = get_i32(&mut src)?;
                Command::AddPublication { channel: get_string(&mut src)?, stream_id }
            }
            msg_type::ADD_EXCLUSIVE_PUBLICATION => {
                let stream_id = get_i32(&mut src)?;
                Command::AddExclusivePublication { channel: get_string(&mut src)?, stream_id }
            }
            msg_type::ADD_SUBSCRIPTION => {
                let stream_id = get_i32(&mut src)?;
                Command::AddSubscription { channel: get_string(&mut src)?, stream_id }
            }
            msg_type::REMOVE_PUBLICATION => Command::RemovePublication {
                registration_id: get_i64(&mut src)?,
            },
            msg_type::REMOVE_SUBSCRIPTION => Command::RemoveSubscription {
                registration_id: get_i64(&mut src)?,
            },
            msg_type::CLIENT_KEEPALIVE => Command::ClientKeepalive,
            msg_type::CLIENT_CLOSE => Command::ClientClose,
            other => return Err(CodecError::UnknownMessageType(other)),
        };
        finish(src)?;
        Ok(Self {
            client_id,
            correlation_id,
            command,
        })
    }
}

/// Reason a command failed in the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    InvalidChannel,
    UnknownSubscription,
    UnknownPublication,
    ChannelEndpointError,
    MalformedCommand,
    Unknown(i32),
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Generic => 0,
            ErrorCode::InvalidChannel => 1,
            ErrorCode::UnknownSubscription => 2,
            ErrorCode::UnknownPublication => 3,
            ErrorCode::ChannelEndpointError => 4,
            ErrorCode::MalformedCommand => 5,
            ErrorCode::Unknown(code) => code,
        }
    }

    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ErrorCode::Generic,
            1 => ErrorCode::InvalidChannel,
            2 => ErrorCode::UnknownSubscription,
            3 => ErrorCode::UnknownPublication,
            4 => ErrorCode::ChannelEndpointError,
            5 => ErrorCode::MalformedCommand,
            other => ErrorCode::Unknown(other),
        }
    }
}

/// Payload of a publication-ready response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReady {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    /// Location of the mapped log buffer file.
    pub log_file: String,
}

/// Payload of an image-available notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReady {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub log_file: String,
    pub source_identity: String,
}

/// A message from the driver to its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    PublicationReady(PublicationReady),
    ExclusivePublicationReady(PublicationReady),
    SubscriptionReady {
        correlation_id: i64,
    },
    OperationSuccess {
        correlation_id: i64,
    },
    Error {
        offending_correlation_id: i64,
        code: ErrorCode,
        message: String,
    },
    AvailableImage(ImageReady),
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
    },
    ClientTimeout {
        client_id: i64,
    },
}

impl Response {
    pub fn msg_type_id(&self) -> i32 {
        match self {
            Response::PublicationReady(_) => msg_type::ON_PUBLICATION_READY,
            Response::ExclusivePublicationReady(_) => msg_type::ON_EXCLUSIVE_PUBLICATION_READY,
            Response::SubscriptionReady { .. } => msg_type::ON_SUBSCRIPTION_READY,
            Response::OperationSuccess { .. } => msg_type::ON_OPERATION_SUCCESS,
            Response::Error { .. } => msg_type::ON_ERROR,
            Response::AvailableImage(_) => msg_type::ON_AVAILABLE_IMAGE,
            Response::UnavailableImage { .. } => msg_type::ON_UNAVAILABLE_IMAGE,
            Response::ClientTimeout { .. } => msg_type::ON_CLIENT_TIMEOUT,
        }
    }

    /// The correlation id this message answers, if it answers one.
    pub fn correlation_id(&self) -> Option<i64> {
        match self {
            Response::PublicationReady(ready) | Response::ExclusivePublicationReady(ready) => {
                Some(ready.correlation_id)
            }
            Response::SubscriptionReady { correlation_id }
            | Response::OperationSuccess { correlation_id } => Some(*correlation_id),
            Response::Error { offending_correlation_id, .. } => Some(*offending_correlation_id),
            Response::AvailableImage(_)
            | Response::UnavailableImage { .. }
            | Response::ClientTimeout { .. } => None,
        }
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Response::PublicationReady(ready) | Response::ExclusivePublicationReady(ready) => {
                dst.put_i64_le(ready.correlation_id);
                dst.put_i64_le(ready.registration_id);
                dst.put_i32_le(ready.session_id);
                dst.put_i32_le(ready.stream_id);
                put_string(dst, &ready.log_file);
            }
            Response::SubscriptionReady { correlation_id }
            | Response::OperationSuccess { correlation_id } => {
                dst.put_i64_le(*correlation_id);
            }
            Response::Error {
                offending_correlation_id,
                code,
                message,
            } => {
                dst.put_i64_le(*offending_correlation_id);
                dst.put_i32_le(code.as_i32());
                put_string(dst, message);
            }
            Response::AvailableImage(image) => {
                dst.put_i64_le(image.correlation_id);
                dst.put_i64_le(image.subscription_registration_id);
                dst.put_i32_le(image.session_id);
                dst.put_i32_le(image.stream_id);
                put_string(dst, &image.log_file);
                put_string(dst, &image.source_identity);
            }
            Response::UnavailableImage {
                correlation_id,
                subscription_registration_id,
                stream_id,
            } => {
                dst.put_i64_le(*correlation_id);
                dst.put_i64_le(*subscription_registration_id);
                dst.put_i32_le(*stream_id);
            }
            Response::ClientTimeout { client_id } => {
                dst.put_i64_le(*client_id);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }

    pub fn decode(msg_type_id: i32, mut src: &[u8]) -> Result<Self, CodecError> {
        let response = match msg_type_id {
            msg_type::ON_PUBLICATION_READY => Response::PublicationReady(get_publication_ready(&mut src)?),
            msg_type::ON_EXCLUSIVE_PUBLICATION_READY => {
                Response::ExclusivePublicationReady(get_publication_ready(&mut src)?)
            }
            msg_type::ON_SUBSCRIPTION_READY => Response::SubscriptionReady {
                correlation_id: get_i64(&mut src)?,
            },
            msg_type::ON_OPERATION_SUCCESS => Response::OperationSuccess {
                correlation_id: get_i64(&mut src)?,
            },
            msg_type::ON_ERROR => {
                let offending_correlation_id = get_i64(&mut src)?;
                let code = ErrorCode::from_i32(get_i32(&mut src)?);
                Response::Error {
                    offending_correlation_id,
                    code,
                    message: get_string(&mut src)?,
                }
            }
            msg_type::ON_AVAILABLE_IMAGE => {
                let correlation_id = get_i64(&mut src)?;
                let subscription_registration_id = get_i64(&mut src)?;
                let session_id = get_i32(&mut src)?;
                let stream_id = get_i32(&mut src)?;
                let log_file = get_string(&mut src)?;
                Response::AvailableImage(ImageReady {
                    correlation_id,
                    subscription_registration_id,
                    session_id,
                    stream_id,
                    log_file,
                    source_identity: get_string(&mut src)?,
                })
            }
            msg_type::ON_UNAVAILABLE_IMAGE => Response::UnavailableImage {
                correlation_id: get_i64(&mut src)?,
                subscription_registration_id: get_i64(&mut src)?,
                stream_id: get_i32(&mut src)?,
            },
            msg_type::ON_CLIENT_TIMEOUT => Response::ClientTimeout {
                client_id: get_i64(&mut src)?,
            },
            other => return Err(CodecError::UnknownMessageType(other)),
        };
        finish(src)?;
        Ok(response)
    }
}

fn get_publication_ready(src: &mut &[u8]) -> Result<PublicationReady, CodecError> {
    Ok(PublicationReady {
        correlation_id: get_i64(src)?,
        registration_id: get_i64(src)?,
        session_id: get_i32(src)?,
        stream_id: get_i32(src)?,
        log_file: get_string(src)?,
    })
}

fn ensure(src: &[u8], needed: usize) -> Result<(), CodecError> {
    if src.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: src.remaining(),
        });
    }
    Ok(())
}

fn get_i32(src: &mut &[u8]) -> Result<i32, CodecError> {
    ensure(src, 4)?;
    Ok(src.get_i32_le())
}

fn get_i64(src: &mut &[u8]) -> Result<i64, CodecError> {
    ensure(src, 8)?;
    Ok(src.get_i64_le())
}

fn get_string(src: &mut &[u8]) -> Result<String, CodecError> {
    let len = get_i32(src)?;
    let len_usize = usize::try_from(len).map_err(|_| CodecError::InvalidLength(len))?;
    ensure(src, len_usize)?;
    let value = std::str::from_utf8(&src[..len_usize])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_owned();
    src.advance(len_usize);
    Ok(value)
}

fn put_string(dst: &mut impl BufMut, value: &str) {
    dst.put_i32_le(value.len() as i32);
    dst.put_slice(value.as_bytes());
}

fn finish(src: &[u8]) -> Result<(), CodecError> {
    if src.has_remaining() {
        return Err(CodecError::TrailingBytes(src.remaining()));
    }
    Ok(())
}
