//! Frame kinds carried in the outer frame header.

use std::fmt;

/// What a frame is for. Travels as a little-endian `u16` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Client request awaiting exactly one reply.
    Request,
    /// Server reply to the most recent request.
    Reply,
    /// Published event, never answered.
    Event,
    /// Subscriber hello and the publisher's acknowledgement.
    Subscribe,
}

impl FrameKind {
    /// Wire tag of this kind.
    pub const fn tag(self) -> u16 {
        match self {
            FrameKind::Request => 1,
            FrameKind::Reply => 2,
            FrameKind::Event => 3,
            FrameKind::Subscribe => 4,
        }
    }

    /// Kind for a wire tag, `None` for tags this version does not know.
    pub const fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(FrameKind::Request),
            2 => Some(FrameKind::Reply),
            3 => Some(FrameKind::Event),
            4 => Some(FrameKind::Subscribe),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            FrameKind::Request => "REQUEST",
            FrameKind::Reply => "REPLY",
            FrameKind::Event => "EVENT",
            FrameKind::Subscribe => "SUBSCRIBE",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
