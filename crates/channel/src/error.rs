/// Error kinds the rendezvous state machine distinguishes. The HTTP
/// surface maps each to a status code; none of these are retriable by the
/// offending client except [`ChannelError::Unavailable`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Missing, wrong-length, or otherwise malformed client id. Maps to
    /// 400. If it arrived on an existing channel, that channel has
    /// already been destroyed by the time this is returned.
    #[error("invalid X-KeyExchange-Id")]
    BadClientId,

    /// A third distinct client id showed up on a channel that already has
    /// two. Treated as hostile, not merely erroneous: the channel is
    /// destroyed before this is returned.
    #[error("unknown X-KeyExchange-Id for a full channel")]
    UnknownThirdParty,

    /// No channel exists under this id. Maps to 404; not an audit event.
    #[error("channel not found")]
    NotFound,

    /// `If-Match`/`If-None-Match` precondition failed. Maps to 412; no
    /// side effects occurred. Carries the channel's current etag so the
    /// HTTP layer can echo it back, or `None` if the payload is still the
    /// sentinel.
    #[error("precondition failed")]
    PreconditionFailed { etag: Option<String> },

    /// The shared cache failed a write or health probe. Maps to 503.
    #[error("cache backend unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}
