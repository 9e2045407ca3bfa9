//! UID Range Planner
//!
//! Splits a mailbox into consecutive fetch windows. Windows are planned
//! in sequence-number space and exposed as UID ranges, so every message
//! present when a window is planned falls in exactly one window.

use crate::error::Result;
use crate::imap::{MessagePosition, SequenceResolver};
use std::fmt;

/// Upper end of a [`UidRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidBound {
    Uid(u32),
    /// `*`: the last message in the mailbox.
    Open,
}

/// An inclusive UID window plus the block size it was planned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub from_uid: u32,
    pub to: UidBound,
    pub block_size: u32,
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            UidBound::Uid(to) => write!(f, "{}:{to}", self.from_uid),
            UidBound::Open => write!(f, "{}:*", self.from_uid),
        }
    }
}

/// Where the first window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStart {
    /// A sequence number, usually 1 for a fresh mailbox.
    Sequence(u32),
    /// The first message with at least this UID, used to resume.
    Uid(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Planned {
    range: UidRange,
    from_seq: u32,
    to_seq: Option<u32>,
}

#[derive(Debug)]
pub struct UidRangePlanner {
    total: Option<u32>,
    current: Option<Planned>,
}

impl UidRangePlanner {
    /// Planner over a mailbox of `total` messages; `None` when the count
    /// is unknown, which yields a single open window.
    #[must_use]
    pub const fn new(total: Option<u32>) -> Self {
        Self {
            total,
            current: None,
        }
    }

    /// The window to fetch next, `None` once exhausted.
    #[must_use]
    pub fn window(&self) -> Option<&UidRange> {
        self.current.as_ref().map(|p| &p.range)
    }

    /// Sequence numbers covered by the current window, when known.
    #[must_use]
    pub fn sequence_span(&self) -> Option<(u32, u32)> {
        self.current
            .and_then(|p| p.to_seq.map(|to| (p.from_seq, to)))
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }

    /// Plan the first window.
    pub async fn init<R>(&mut self, resolver: &mut R, start: RangeStart, block_size: u32) -> Result<()>
    where
        R: SequenceResolver + ?Sized,
    {
        // Without a count there is nothing to resolve a start against,
        // so the whole mailbox is one window.
        let Some(total) = self.total else {
            self.current = Some(Planned {
                range: UidRange {
                    from_uid: 1,
                    to: UidBound::Open,
                    block_size,
                },
                from_seq: 1,
                to_seq: None,
            });
            return Ok(());
        };

        let from = match start {
            RangeStart::Sequence(seq) if seq > total => None,
            RangeStart::Sequence(seq) => resolver.resolve_sequence(seq).await?,
            RangeStart::Uid(uid) => resolver.resolve_uid(uid).await?,
        };
        self.plan_from(resolver, from, total, block_size).await
    }

    /// Plan the window following the current one.
    pub async fn advance<R>(&mut self, resolver: &mut R, block_size: u32) -> Result<()>
    where
        R: SequenceResolver + ?Sized,
    {
        let (Some(total), Some(Planned {
            to_seq: Some(to_seq),
            ..
        })) = (self.total, self.current)
        else {
            self.current = None;
            return Ok(());
        };

        let next = to_seq.saturating_add(1);
        let from = if next > total {
            None
        } else {
            resolver.resolve_sequence(next).await?
        };
        self.plan_from(resolver, from, total, block_size).await
    }

    async fn plan_from<R>(
        &mut self,
        resolver: &mut R,
        from: Option<MessagePosition>,
        total: u32,
        block_size: u32,
    ) -> Result<()>
    where
        R: SequenceResolver + ?Sized,
    {
        let Some(from) = from.filter(|p| p.seq <= total) else {
            self.current = None;
            return Ok(());
        };

        let to_seq = from.seq.saturating_add(block_size).min(total);
        let to = resolver
            .resolve_sequence(to_seq)
            .await?
            .map_or(UidBound::Open, |p| UidBound::Uid(p.uid));

        self.current = Some(Planned {
            range: UidRange {
                from_uid: from.uid,
                to,
                block_size,
            },
            from_seq: from.seq,
            to_seq: Some(to_seq),
        });
        Ok(())
    }
}
