//! Close codes and the reconnect policy derived from them.

/// Close codes seen on a shard connection.
///
/// The 4xxx range is assigned by the gateway. The 3xxx range is
/// shard-initiated: the shard tags its own closes so the close handler
/// can tell a deliberate teardown from a server-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Shard is shutting down for good.
    Shutdown = 3000,
    /// Heartbeat ack went missing; the socket is presumed dead.
    ZombiedConnection = 3010,
    /// Old connection torn down ahead of a resume.
    ResumeClosingOldConnection = 3024,
    /// Test harness finished with this shard.
    TestingFinished = 3064,
    /// Shard is being moved by a reshard.
    Resharded = 3065,
    /// Old connection torn down ahead of a fresh identify.
    ReIdentifying = 3066,
    /// Unknown server error.
    UnknownError = 4000,
    /// Invalid opcode sent.
    UnknownOpcode = 4001,
    /// Invalid payload encoding.
    DecodeError = 4002,
    /// Sent a payload before identifying.
    NotAuthenticated = 4003,
    /// Invalid token.
    AuthenticationFailed = 4004,
    /// Sent identify twice.
    AlreadyAuthenticated = 4005,
    /// Invalid sequence number in a resume.
    InvalidSeq = 4007,
    /// Too many payloads.
    RateLimited = 4008,
    /// Session timed out server-side.
    SessionTimedOut = 4009,
    /// Invalid shard configuration.
    InvalidShard = 4010,
    /// More shards are required.
    ShardingRequired = 4011,
    /// Invalid or outdated API version.
    InvalidApiVersion = 4012,
    /// Invalid intents value.
    InvalidIntents = 4013,
    /// Intents not enabled for this application.
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Create a `CloseCode` from a raw value.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            3000 => Some(Self::Shutdown),
            3010 => Some(Self::ZombiedConnection),
            3024 => Some(Self::ResumeClosingOldConnection),
            3064 => Some(Self::TestingFinished),
            3065 => Some(Self::Resharded),
            3066 => Some(Self::ReIdentifying),
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSeq),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimedOut),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    /// Raw wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Name of this close code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Shutdown => "Shutdown",
            Self::ZombiedConnection => "ZombiedConnection",
            Self::ResumeClosingOldConnection => "ResumeClosingOldConnection",
            Self::TestingFinished => "TestingFinished",
            Self::Resharded => "Resharded",
            Self::ReIdentifying => "ReIdentifying",
            Self::UnknownError => "UnknownError",
            Self::UnknownOpcode => "UnknownOpcode",
            Self::DecodeError => "DecodeError",
            Self::NotAuthenticated => "NotAuthenticated",
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::AlreadyAuthenticated => "AlreadyAuthenticated",
            Self::InvalidSeq => "InvalidSeq",
            Self::RateLimited => "RateLimited",
            Self::SessionTimedOut => "SessionTimedOut",
            Self::InvalidShard => "InvalidShard",
            Self::ShardingRequired => "ShardingRequired",
            Self::InvalidApiVersion => "InvalidApiVersion",
            Self::InvalidIntents => "InvalidIntents",
            Self::DisallowedIntents => "DisallowedIntents",
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u16())
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

/// What the shard does after a close, derived purely from the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Test harness close; go offline without reconnecting.
    Testing,
    /// Deliberate teardown; the next step is already in flight.
    Graceful,
    /// The session is unusable; start a fresh identify.
    ReIdentify,
    /// Non-recoverable; fail in-flight operations and go offline.
    Fatal,
    /// Anything else; resume the session.
    Resume,
}

impl CloseBehavior {
    /// Classify a close code.
    ///
    /// Unknown codes (including 1xxx transport closes) default to
    /// [`CloseBehavior::Resume`].
    #[must_use]
    pub fn classify(code: u16) -> Self {
        match CloseCode::from_u16(code) {
            Some(CloseCode::TestingFinished) => Self::Testing,
            Some(
                CloseCode::Shutdown
                | CloseCode::ReIdentifying
                | CloseCode::Resharded
                | CloseCode::ResumeClosingOldConnection
                | CloseCode::ZombiedConnection,
            ) => Self::Graceful,
            Some(
                CloseCode::UnknownOpcode
                | CloseCode::NotAuthenticated
                | CloseCode::InvalidSeq
                | CloseCode::RateLimited
                | CloseCode::SessionTimedOut,
            ) => Self::ReIdentify,
            Some(
                CloseCode::AuthenticationFailed
                | CloseCode::InvalidShard
                | CloseCode::ShardingRequired
                | CloseCode::InvalidApiVersion
                | CloseCode::InvalidIntents
                | CloseCode::DisallowedIntents,
            ) => Self::Fatal,
            Some(
                CloseCode::UnknownError | CloseCode::DecodeError | CloseCode::AlreadyAuthenticated,
            )
            | None => Self::Resume,
        }
    }
}
