//! The overlay's wire envelope: a small closed set of message kinds, each
//! carrying exactly the fields its handler needs (spec.md §3, §4.4).

use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::mi::AggregatedRecord;

/// The rank address a command or result is scoped to. `Broadcast` reaches
/// every back-end without the sender consulting the rank map; `Frontend`
/// names the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankTarget {
    Broadcast,
    Frontend,
    Ranks(Interval),
}

impl RankTarget {
    pub fn includes(&self, vid: i64) -> bool {
        match self {
            RankTarget::Broadcast => true,
            RankTarget::Frontend => false,
            RankTarget::Ranks(i) => i.contains(vid),
        }
    }
}

/// A single overlay message. Multi-header/multi-payload are framing-layer
/// concerns ([`crate::transport::framing`]) and never appear here; this
/// type is what framing reconstructs into before handing off to a loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A debugger (or shell built-in) command text, addressed at `target`
    /// and correlated by `token` so replies can be matched back.
    Command { target: RankTarget, token: u64, text: String },
    /// An aggregated batch of records produced by one back-end or merged
    /// by a relay, addressed upward.
    Out { batch: Vec<AggregatedRecord> },
    /// Adds subtypes to a back-end's suppression set.
    Filter { subtypes: Vec<String> },
    /// Removes subtypes from a back-end's suppression set.
    Unfilter { subtypes: Vec<String> },
    /// Front-end → back-end liveness handshake broadcast at startup.
    Hello,
    /// A varprint request for a dotted variable name at a rank set.
    Varprint { target: RankTarget, token: u64, name: String },
    /// The fully-populated variable object for a varprint request, or an
    /// error reason if the DFS could not complete.
    VarprintResult { token: u64, rank: i64, result: Result<crate::coordinator::varobj::VarObj, String> },
    /// SIGTERMs every attached inferior; the back-end keeps running.
    Kill,
    /// Fatal: the receiving back-end exits immediately.
    Die,
    /// Orderly shutdown request (broadcast as a debugger-exit command).
    Quit,
    /// Declares that `count` payload frames for one logical message follow.
    MultiHeader { count: u32 },
    /// One chunk of a split logical message; reassembled in arrival order.
    MultiPayload { data: Vec<u8> },
    /// A back-end's SBD side-channel request to load a file from disk.
    LoadFile { path: String },
    /// The front-end's broadcast reply carrying file bytes (or an error).
    FileData { path: String, data: Vec<u8>, error: bool },
}

impl Message {
    /// A short tag for logging, independent of payload size.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Command { .. } => "command",
            Message::Out { .. } => "out",
            Message::Filter { .. } => "filter",
            Message::Unfilter { .. } => "unfilter",
            Message::Hello => "hello",
            Message::Varprint { .. } => "varprint",
            Message::VarprintResult { .. } => "varprint-result",
            Message::Kill => "kill",
            Message::Die => "die",
            Message::Quit => "quit",
            Message::MultiHeader { .. } => "multi-header",
            Message::MultiPayload { .. } => "multi-payload",
            Message::LoadFile { .. } => "load-file",
            Message::FileData { .. } => "file-data",
        }
    }

    /// Whether a relay may fold two instances of this message together
    /// during its aggregation barrier (spec.md §4.4: only `out` messages
    /// aggregate; everything else passes through in arrival order).
    pub fn is_aggregable(&self) -> bool {
        matches!(self, Message::Out { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_target_broadcast_includes_everyone() {
        assert!(RankTarget::Broadcast.includes(0));
        assert!(RankTarget::Broadcast.includes(9_999));
        assert!(!RankTarget::Frontend.includes(0));
    }

    #[test]
    fn rank_target_ranks_defers_to_interval() {
        let t = RankTarget::Ranks(Interval::range_closed(4, 8));
        assert!(t.includes(4));
        assert!(t.includes(8));
        assert!(!t.includes(9));
    }

    #[test]
    fn only_out_messages_are_aggregable() {
        assert!(Message::Out { batch: Vec::new() }.is_aggregable());
        assert!(!Message::Hello.is_aggregable());
        assert!(!Message::Kill.is_aggregable());
    }
}
