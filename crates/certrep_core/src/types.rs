//! Core type definitions for replication.
//!
//! All of these are small immutable value objects that are copied freely
//! between the connection, the server and the provider.

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// Node or group identifier.
///
/// Identifiers are 128-bit UUIDs. The all-zero value is reserved as
/// "undefined".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; 16]);

impl Id {
    /// The undefined identifier.
    pub const UNDEFINED: Id = Id([0u8; 16]);

    /// Creates an identifier from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a new random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Parses an identifier from its UUID string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(|u| Self(u.into_bytes()))
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns true if this is the undefined identifier.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", Uuid::from_bytes(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

/// Identifier of a transaction within its connection.
///
/// Zero is the undefined sentinel; a transaction with an undefined id is
/// not active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The undefined transaction id.
    pub const UNDEFINED: TransactionId = TransactionId(0);

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is the undefined sentinel.
    #[must_use]
    pub const fn is_undefined(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx:{}", self.0)
    }
}

/// Identifier of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Creates a new client ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Global sequence number assigned by the provider.
///
/// Sequence numbers give the total commit order of the cluster. `-1` is
/// the undefined value and compares lower than every assigned seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqno(pub i64);

impl Seqno {
    /// The undefined sequence number.
    pub const UNDEFINED: Seqno = Seqno(-1);

    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seqno: i64) -> Self {
        Self(seqno)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true if this is the undefined value.
    #[must_use]
    pub const fn is_undefined(self) -> bool {
        self.0 < 0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for Seqno {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global transaction id: group id plus seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gtid {
    /// Group (cluster history) identifier.
    pub id: Id,
    /// Position in the group history.
    pub seqno: Seqno,
}

impl Gtid {
    /// The undefined GTID.
    pub const UNDEFINED: Gtid = Gtid {
        id: Id::UNDEFINED,
        seqno: Seqno::UNDEFINED,
    };

    /// Creates a new GTID.
    #[must_use]
    pub const fn new(id: Id, seqno: Seqno) -> Self {
        Self { id, seqno }
    }

    /// Returns true if the seqno part is undefined.
    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        self.seqno.is_undefined()
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.seqno)
    }
}

/// Source transaction id: who originated a write-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stid {
    /// Originating server.
    pub server_id: Id,
    /// Transaction id on the originating connection.
    pub transaction_id: TransactionId,
    /// Originating connection.
    pub client_id: ClientId,
}

impl Stid {
    /// Creates a new source transaction id.
    #[must_use]
    pub const fn new(server_id: Id, transaction_id: TransactionId, client_id: ClientId) -> Self {
        Self {
            server_id,
            transaction_id,
            client_id,
        }
    }
}

/// Write-set flag bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WsFlags(u32);

impl WsFlags {
    /// No flags.
    pub const NONE: WsFlags = WsFlags(0);
    /// Write-set starts a transaction.
    pub const START_TRANSACTION: WsFlags = WsFlags(1 << 0);
    /// Write-set commits a transaction.
    pub const COMMIT: WsFlags = WsFlags(1 << 1);
    /// Write-set rolls back a transaction.
    pub const ROLLBACK: WsFlags = WsFlags(1 << 2);
    /// Write-set must be applied in total order isolation.
    pub const ISOLATION: WsFlags = WsFlags(1 << 3);
    /// Write-set is unsafe for parallel applying.
    pub const PA_UNSAFE: WsFlags = WsFlags(1 << 4);
    /// Write-set carries a snapshot.
    pub const SNAPSHOT: WsFlags = WsFlags(1 << 5);

    /// Creates flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: WsFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the write-set starts a transaction.
    #[must_use]
    pub const fn starts_transaction(self) -> bool {
        self.contains(Self::START_TRANSACTION)
    }

    /// Returns true if the write-set commits a transaction.
    #[must_use]
    pub const fn commits_transaction(self) -> bool {
        self.contains(Self::COMMIT)
    }

    /// Returns true if the write-set rolls back a transaction.
    #[must_use]
    pub const fn rolls_back_transaction(self) -> bool {
        self.contains(Self::ROLLBACK)
    }

    /// Returns true if the write-set requires total order isolation.
    #[must_use]
    pub const fn is_isolation(self) -> bool {
        self.contains(Self::ISOLATION)
    }
}

impl std::ops::BitOr for WsFlags {
    type Output = WsFlags;

    fn bitor(self, rhs: WsFlags) -> WsFlags {
        WsFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for WsFlags {
    fn bitor_assign(&mut self, rhs: WsFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::LowerHex for WsFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Opaque handle correlating a transaction with provider-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WsHandle {
    /// The transaction this handle belongs to.
    pub transaction_id: TransactionId,
    /// Provider-private value.
    pub opaque: u64,
}

impl WsHandle {
    /// Creates a handle for a transaction.
    #[must_use]
    pub const fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            opaque: 0,
        }
    }

    /// Creates a handle carrying a provider-private value.
    #[must_use]
    pub const fn with_opaque(transaction_id: TransactionId, opaque: u64) -> Self {
        Self {
            transaction_id,
            opaque,
        }
    }
}

/// Replication metadata filled in by the provider on certification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WsMeta {
    /// Global position of the write-set.
    pub gtid: Gtid,
    /// Where the write-set came from.
    pub stid: Stid,
    /// Last seqno this write-set causally depends on.
    pub depends_on: Seqno,
    /// Write-set flags.
    pub flags: WsFlags,
}

impl WsMeta {
    /// Creates new metadata.
    #[must_use]
    pub const fn new(gtid: Gtid, stid: Stid, depends_on: Seqno, flags: WsFlags) -> Self {
        Self {
            gtid,
            stid,
            depends_on,
            flags,
        }
    }

    /// Returns the assigned seqno (undefined until ordered).
    #[must_use]
    pub const fn seqno(&self) -> Seqno {
        self.gtid.seqno
    }

    /// Returns the originating transaction id.
    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        self.stid.transaction_id
    }
}

/// Access type of a write-set key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Read access, compatible with other shared accesses.
    Shared,
    /// Weaker than exclusive, used for referential checks.
    SemiShared,
    /// Weaker than exclusive, used for parent-row updates.
    SemiExclusive,
    /// Write access.
    Exclusive,
}

impl KeyType {
    /// Returns true if two accesses to the same key conflict.
    #[must_use]
    pub fn conflicts_with(self, other: KeyType) -> bool {
        !(self == KeyType::Shared && other == KeyType::Shared)
    }
}

/// A write-set key: an ordered sequence of opaque byte-string parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    key_type: KeyType,
    parts: Vec<Bytes>,
}

impl Key {
    /// Maximum number of parts a key may carry.
    pub const MAX_PARTS: usize = 3;

    /// Creates an empty key with the given access type.
    #[must_use]
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            parts: Vec::with_capacity(Self::MAX_PARTS),
        }
    }

    /// Appends a key part.
    ///
    /// Returns false if the key already has [`Key::MAX_PARTS`] parts.
    pub fn append_part(&mut self, part: impl Into<Bytes>) -> bool {
        if self.parts.len() >= Self::MAX_PARTS {
            return false;
        }
        self.parts.push(part.into());
        true
    }

    /// Builder form of [`Key::append_part`]; extra parts are dropped.
    #[must_use]
    pub fn with_part(mut self, part: impl Into<Bytes>) -> Self {
        let _ = self.append_part(part);
        self
    }

    /// Returns the access type.
    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Returns the key parts.
    #[must_use]
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Returns the number of parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Returns true if the key has no parts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Membership status of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    /// The node belongs to the primary component.
    Primary,
    /// The node is partitioned away from the primary component.
    NonPrimary,
    /// The node left the group.
    Disconnected,
}

/// A member of the cluster as seen in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Server id.
    pub id: Id,
    /// Human readable name.
    pub name: String,
    /// Address clients use to reach the member.
    pub incoming: String,
}

/// Cluster membership view delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    /// Group position at the time of the view change.
    pub state_id: Gtid,
    /// Monotonic view number.
    pub view_seqno: Seqno,
    /// Primary component status.
    pub status: ViewStatus,
    /// Members in the view.
    pub members: Vec<Member>,
    /// Index of the receiving node in `members`, if present.
    pub own_index: Option<usize>,
}

impl View {
    /// Returns true if the view is a primary component view.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.status == ViewStatus::Primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_seqno_orders_first() {
        assert!(Seqno::UNDEFINED < Seqno::new(0));
        assert!(Seqno::UNDEFINED.is_undefined());
        assert_eq!(Seqno::new(41).next(), Seqno::new(42));
    }

    #[test]
    fn transaction_id_sentinel() {
        assert!(TransactionId::UNDEFINED.is_undefined());
        assert!(!TransactionId::new(7).is_undefined());
        assert_eq!(format!("{}", TransactionId::new(7)), "trx:7");
    }

    #[test]
    fn flags_combine() {
        let flags = WsFlags::START_TRANSACTION | WsFlags::COMMIT;
        assert!(flags.starts_transaction());
        assert!(flags.commits_transaction());
        assert!(!flags.rolls_back_transaction());
        assert_eq!(flags.bits(), 0b11);
        assert_eq!(format!("{flags:x}"), "3");
    }

    #[test]
    fn key_part_limit() {
        let mut key = Key::new(KeyType::Exclusive);
        assert!(key.append_part(&b"db"[..]));
        assert!(key.append_part(&b"table"[..]));
        assert!(key.append_part(&b"row"[..]));
        assert!(!key.append_part(&b"extra"[..]));
        assert_eq!(key.len(), Key::MAX_PARTS);
    }

    #[test]
    fn shared_keys_do_not_conflict() {
        assert!(!KeyType::Shared.conflicts_with(KeyType::Shared));
        assert!(KeyType::Shared.conflicts_with(KeyType::Exclusive));
        assert!(KeyType::SemiShared.conflicts_with(KeyType::SemiShared));
    }

    #[test]
    fn id_roundtrips_through_string() {
        let id = Id::random();
        assert_eq!(Id::parse(&id.to_string()), Some(id));
        assert!(Id::UNDEFINED.is_undefined());
    }
}
