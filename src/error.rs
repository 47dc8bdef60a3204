//! Transport error taxonomy.
//!
//! Every fallible bus operation returns [`Result`]. The variants form a
//! closed set so callers can match on them exhaustively; success is plain
//! `Ok`. Underlying `io::Error` details are logged at the failure site.

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Bus transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum BusError {
    /// Socket creation or option setup failed.
    #[error("socket creation failed")]
    SocketFailed,

    /// Connecting failed, or the connection is not (or no longer) open.
    #[error("connection failed")]
    ConnectionFailed,

    /// Binding the listening socket failed.
    #[error("bind failed")]
    BindFailed,

    /// Putting the socket into listening mode failed.
    #[error("listen failed")]
    ListenFailed,

    /// Accepting an incoming connection failed.
    #[error("accept failed")]
    AcceptFailed,

    /// A send was rejected or incomplete.
    #[error("send failed")]
    SendFailed,

    /// A receive failed.
    #[error("receive failed")]
    ReceiveFailed,

    /// Closing a socket failed.
    #[error("close failed")]
    CloseFailed,

    /// Shutting a connection down failed.
    #[error("disconnect failed")]
    DisconnectFailed,

    /// No connected client is registered under the requested id.
    #[error("invalid client id")]
    InvalidClientId,

    /// A registered callback could not be invoked.
    #[error("callback error")]
    CallbackError,

    /// The socket interface is unusable for this operation.
    #[error("socket interface error")]
    SocketInterfaceError,

    /// A payload is larger than the packet or message limit.
    #[error("invalid data size")]
    InvalidDataSize,

    /// Bytes do not form a valid packet, or a message is incomplete.
    #[error("invalid data")]
    InvalidData,

    /// An id failed validation.
    #[error("invalid id")]
    InvalidId,

    /// An argument was rejected at call time.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
