//! The curator's durable state machine.
//!
//! This crate is what the consensus layer drives: a tagged command stream
//! ([`Command`], carried as `{tag: u16 BE}{body}` envelopes in log entries)
//! and a deterministic apply engine ([`StateHandler`]) that applies each
//! committed entry to the persistent state in a single write transaction.
//!
//! Apply is strictly serial and replay-safe: re-applying an entry whose index
//! the store has already absorbed is a no-op, so crash recovery can replay
//! the log from any point. Two replicas that apply the same entries arrive at
//! bit-identical stores, which the periodic checksum commands verify.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cmd;
mod fsm;

pub use cmd::{
    decode_command, encode_command, AddPartitionCmd, AllocateRsChunkIdsCmd, ChangeTractCmd,
    ChecksumCmd, Command, CommitRsChunkCmd, CreateBlobCmd, CreateTsidCacheCmd, DeleteBlobCmd,
    EnvelopeError, ExtendBlobCmd, FinishDeleteCmd, Response, SetMetadataCmd, SetReadOnlyModeCmd,
    SetRegistrationCmd, SyncPartitionsCmd, TractInfo, UndeleteBlobCmd, UpdateRsHostsCmd,
    UpdateStorageClassCmd, UpdateTimesCmd, VerifyChecksumCmd,
};
pub use fsm::{Fsm, Leadership, LeadershipHook, LogEntry, StateHandler};
