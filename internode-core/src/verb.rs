//! The closed enumeration of message kinds exchanged between nodes.

/// A message kind with fixed request and reply payload types.
///
/// The discriminants form a stable integer encoding: they appear on the
/// wire and index fixed-size arrays (handler slots, dropped-message
/// counters), so existing values must never be renumbered. New verbs are
/// appended before [`Verb::COUNT`] is updated.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Implicit handshake: the first message on every outbound connection,
    /// carrying the sender's broadcast address and source cpu id.
    ClientId = 0,
    /// Apply a write to a replica.
    Mutation = 1,
    /// Acknowledge an applied write.
    MutationDone = 2,
    /// Read a row from a replica.
    ReadData = 3,
    /// Read a digest of a row for read repair.
    ReadDigest = 4,
    /// Liveness probe used by the failure detector.
    GossipEcho = 5,
    /// First round of a gossip exchange.
    GossipDigestSyn = 6,
    /// Second round of a gossip exchange.
    GossipDigestAck = 7,
    /// Third round of a gossip exchange.
    GossipDigestAck2 = 8,
    /// Announce an orderly shutdown to a peer.
    GossipShutdown = 9,
    /// Push a schema definitions update.
    DefinitionsUpdate = 10,
    /// Truncate a table on a replica.
    Truncate = 11,
    /// Signal completion of a replication task.
    ReplicationFinished = 12,
    /// Request a peer's schema migrations.
    MigrationRequest = 13,
    /// Transfer a batch of mutations during streaming.
    StreamMutation = 14,
    /// Signal the end of a mutation stream.
    StreamMutationDone = 15,
    /// Look up a schema version by id.
    GetSchemaVersion = 16,
}

impl Verb {
    /// Number of verbs; the length of any per-verb array.
    pub const COUNT: usize = 17;

    /// All verbs, in encoding order.
    pub const ALL: [Verb; Verb::COUNT] = [
        Verb::ClientId,
        Verb::Mutation,
        Verb::MutationDone,
        Verb::ReadData,
        Verb::ReadDigest,
        Verb::GossipEcho,
        Verb::GossipDigestSyn,
        Verb::GossipDigestAck,
        Verb::GossipDigestAck2,
        Verb::GossipShutdown,
        Verb::DefinitionsUpdate,
        Verb::Truncate,
        Verb::ReplicationFinished,
        Verb::MigrationRequest,
        Verb::StreamMutation,
        Verb::StreamMutationDone,
        Verb::GetSchemaVersion,
    ];

    /// The stable wire encoding of this verb.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Index into per-verb arrays.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error returned when decoding an out-of-range verb value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown verb encoding: {0}")]
pub struct UnknownVerb(
    /// The unrecognized wire value.
    pub u32,
);

impl TryFrom<u32> for Verb {
    type Error = UnknownVerb;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Verb::ALL
            .get(value as usize)
            .copied()
            .ok_or(UnknownVerb(value))
    }
}
