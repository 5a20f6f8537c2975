//! The send wheel: a ring over the outbound streams that currently hold
//! unsent data, kept sorted by stream id.
//!
//! Streams are stored in a plain vector indexed by stream id; membership and
//! the ring neighbours live in each stream's [`RingLink`].

use super::stream::OutStream;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingLink {
    next: u16,
    prev: u16,
    on_wheel: bool,
}

impl RingLink {
    pub fn on_wheel(&self) -> bool {
        self.on_wheel
    }
}

#[derive(Debug, Default)]
pub struct Wheel {
    head: Option<u16>,
    len: usize,
}

impl Wheel {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, streams: &mut [OutStream], sid: u16) {
        if streams[sid as usize].link.on_wheel {
            return;
        }
        let Some(head) = self.head else {
            streams[sid as usize].link = RingLink {
                next: sid,
                prev: sid,
                on_wheel: true,
            };
            self.head = Some(sid);
            self.len = 1;
            return;
        };

        // First member with a larger id; wrapping back to head means "append".
        let mut at = head;
        loop {
            if at > sid {
                break;
            }
            at = streams[at as usize].link.next;
            if at == head {
                break;
            }
        }

        let prev = streams[at as usize].link.prev;
        streams[sid as usize].link = RingLink {
            next: at,
            prev,
            on_wheel: true,
        };
        streams[prev as usize].link.next = sid;
        streams[at as usize].link.prev = sid;
        if sid < head {
            self.head = Some(sid);
        }
        self.len += 1;
    }

    pub fn remove(&mut self, streams: &mut [OutStream], sid: u16) {
        let link = streams[sid as usize].link;
        if !link.on_wheel {
            return;
        }
        if link.next == sid {
            self.head = None;
        } else {
            streams[link.prev as usize].link.next = link.next;
            streams[link.next as usize].link.prev = link.prev;
            if self.head == Some(sid) {
                self.head = Some(link.next);
            }
        }
        streams[sid as usize].link = RingLink::default();
        self.len -= 1;
    }

    /// The member serviced after `cursor`, wrapping around to the lowest id.
    pub fn next_after(&self, streams: &[OutStream], cursor: Option<u16>) -> Option<u16> {
        let head = self.head?;
        let Some(cursor) = cursor else {
            return Some(head);
        };
        if let Some(stream) = streams.get(cursor as usize) {
            if stream.link.on_wheel {
                return Some(stream.link.next);
            }
        }
        // The cursor left the wheel: continue with the next larger id.
        let mut at = head;
        loop {
            if at > cursor {
                return Some(at);
            }
            at = streams[at as usize].link.next;
            if at == head {
                return Some(head);
            }
        }
    }

    pub fn members(&self, streams: &[OutStream]) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(head) = self.head {
            let mut at = head;
            loop {
                out.push(at);
                at = streams[at as usize].link.next;
                if at == head {
                    break;
                }
            }
        }
        out
    }
}
