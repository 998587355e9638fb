//! File synchronization primitives.
//!
//! Files are reconciled optimistically: each party remembers the checksum it
//! last saw acknowledged for a file, proposes changes (full contents or a
//! fragment patch) tagged with that checksum, and the holder applies the
//! change only while the checksum still matches. There is no merge: a
//! rejected proposer re-fetches and retries.

pub mod checksum;
pub mod diff;
pub mod replica;
