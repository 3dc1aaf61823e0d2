//! Pending exchanges
//!
//! An exchange lives for one `call`: it is offered every delivered frame in
//! arrival order and decides when the call is satisfied. Expiry turns the
//! partial state into the absent-padded reply.

use bytes::Bytes;
use std::time::Duration;

use crate::core::protocol::{Decoded, Frame};

/// Frame delivered by the receive path
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Output of the header's decode function
    pub payload: Decoded,
    /// The frame itself
    pub frame: Frame,
}

/// Which uplink headers satisfy a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Any delivered frame
    Any,
    /// One header
    One(Bytes),
    /// A declared list of headers
    Many(Vec<Bytes>),
}

impl Expect {
    /// Expectation from a header list; one header collapses to [`Expect::One`]
    pub fn from_headers(mut headers: Vec<Bytes>) -> Self {
        match headers.len() {
            0 => Self::Any,
            1 => Self::One(headers.remove(0)),
            _ => Self::Many(headers),
        }
    }

    fn contains(&self, header: &[u8]) -> bool {
        match self {
            Self::Any => true,
            Self::One(h) => h.as_ref() == header,
            Self::Many(hs) => hs.iter().any(|h| h.as_ref() == header),
        }
    }
}

/// How many frames a call collects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Return on the first frame matching any expected header
    First,
    /// One payload per expected header, in declared order
    #[default]
    All,
    /// Every matching frame until the deadline
    Unbounded,
}

impl MatchMode {
    /// Mode for a frame count: `-1` collects without limit
    pub fn from_num(num: i32) -> Self {
        if num < 0 {
            Self::Unbounded
        } else {
            Self::All
        }
    }
}

/// Result of a call
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Single expectation or first-match: the payload, absent on timeout
    Single(Option<Decoded>),
    /// One slot per declared header, absent where nothing matched
    Slots(Vec<Option<Decoded>>),
    /// Every matching payload in arrival order
    Collected(Vec<Decoded>),
}

impl Reply {
    /// The payload of a single reply
    pub fn into_single(self) -> Option<Decoded> {
        match self {
            Self::Single(value) => value,
            Self::Slots(slots) => slots.into_iter().flatten().next(),
            Self::Collected(values) => values.into_iter().next(),
        }
    }

    /// Whether nothing matched
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Single(value) => value.is_none(),
            Self::Slots(slots) => slots.iter().all(Option::is_none),
            Self::Collected(values) => values.is_empty(),
        }
    }
}

/// State of one outstanding call
#[derive(Debug)]
pub struct Exchange {
    expect: Expect,
    mode: MatchMode,
    timeout: Duration,
    slots: Vec<Option<Decoded>>,
    collected: Vec<Decoded>,
}

impl Exchange {
    /// Start an exchange
    pub fn new(expect: Expect, mode: MatchMode, timeout: Duration) -> Self {
        let slots = match &expect {
            Expect::Many(headers) => vec![None; headers.len()],
            _ => Vec::new(),
        };
        Self {
            expect,
            mode,
            timeout,
            slots,
            collected: Vec::new(),
        }
    }

    /// Time budget before pauses are added
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Offer a delivered frame; returns the reply once the call is satisfied
    pub fn offer(&mut self, delivery: Delivery) -> Option<Reply> {
        let header = delivery.frame.header.as_ref();
        if !self.expect.contains(header) {
            return None;
        }
        if self.mode == MatchMode::Unbounded {
            self.collected.push(delivery.payload);
            return None;
        }

        let Expect::Many(headers) = &self.expect else {
            return Some(Reply::Single(Some(delivery.payload)));
        };
        if self.mode == MatchMode::First {
            return Some(Reply::Single(Some(delivery.payload)));
        }

        if let Some(slot) = headers
            .iter()
            .zip(self.slots.iter_mut())
            .find(|(h, slot)| h.as_ref() == header && slot.is_none())
            .map(|(_, slot)| slot)
        {
            *slot = Some(delivery.payload);
        }

        // The last declared header closes the exchange even if earlier
        // slots are still empty
        let last = headers.last().map(|h| h.as_ref() == header).unwrap_or(false);
        if last || self.slots.iter().all(Option::is_some) {
            return Some(Reply::Slots(std::mem::take(&mut self.slots)));
        }
        None
    }

    /// Reply at the deadline
    pub fn expire(self) -> Reply {
        match (self.mode, self.expect) {
            (MatchMode::Unbounded, _) => Reply::Collected(self.collected),
            (MatchMode::All, Expect::Many(_)) => Reply::Slots(self.slots),
            _ => Reply::Single(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{FrameKind, FramePayload};

    fn delivery(header: &[u8], payload: &[u8]) -> Delivery {
        Delivery {
            payload: Decoded::raw(payload),
            frame: Frame {
                kind: FrameKind::Command,
                header: Bytes::copy_from_slice(header),
                data_len: payload.len(),
                payload: FramePayload::Binary(Bytes::copy_from_slice(payload)),
                checksum: Bytes::new(),
                length: 0,
                raw_data: Bytes::new(),
            },
        }
    }

    fn headers(list: &[&[u8]]) -> Vec<Bytes> {
        list.iter().map(|h| Bytes::copy_from_slice(h)).collect()
    }

    const A: &[u8] = &[0xBB, 0x01, 0x01];
    const B: &[u8] = &[0xBB, 0x01, 0x02];
    const C: &[u8] = &[0xBB, 0x01, 0x03];

    #[test]
    fn test_declared_order() {
        let mut ex = Exchange::new(Expect::Many(headers(&[A, B, C])), MatchMode::All, Duration::from_secs(1));
        assert!(ex.offer(delivery(B, b"b")).is_none());
        assert!(ex.offer(delivery(A, b"a")).is_none());
        let reply = ex.offer(delivery(C, b"c")).unwrap();
        assert_eq!(
            reply,
            Reply::Slots(vec![
                Some(Decoded::raw(b"a")),
                Some(Decoded::raw(b"b")),
                Some(Decoded::raw(b"c")),
            ])
        );
    }

    #[test]
    fn test_last_header_short_circuits() {
        let mut ex = Exchange::new(Expect::Many(headers(&[A, B, C])), MatchMode::All, Duration::from_secs(1));
        assert!(ex.offer(delivery(A, b"a")).is_none());
        let reply = ex.offer(delivery(C, b"c")).unwrap();
        assert_eq!(
            reply,
            Reply::Slots(vec![Some(Decoded::raw(b"a")), None, Some(Decoded::raw(b"c"))])
        );
    }

    #[test]
    fn test_expiry_pads_slots() {
        let mut ex = Exchange::new(Expect::Many(headers(&[A, B])), MatchMode::All, Duration::from_secs(1));
        assert!(ex.offer(delivery(A, b"a")).is_none());
        assert_eq!(ex.expire(), Reply::Slots(vec![Some(Decoded::raw(b"a")), None]));
    }

    #[test]
    fn test_first_match() {
        let mut ex = Exchange::new(Expect::Many(headers(&[A, B])), MatchMode::First, Duration::from_secs(1));
        assert!(ex.offer(delivery(C, b"c")).is_none());
        assert_eq!(ex.offer(delivery(B, b"b")), Some(Reply::Single(Some(Decoded::raw(b"b")))));
    }

    #[test]
    fn test_unbounded_collects_until_expiry() {
        let mut ex = Exchange::new(Expect::Many(headers(&[A, B])), MatchMode::Unbounded, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(ex.offer(delivery(B, b"b")).is_none());
        }
        assert!(ex.offer(delivery(C, b"c")).is_none());
        match ex.expire() {
            Reply::Collected(values) => assert_eq!(values.len(), 3),
            other => panic!("unexpected {other:?}"),
        }

        let empty = Exchange::new(Expect::One(Bytes::from_static(A)), MatchMode::Unbounded, Duration::from_secs(1));
        assert_eq!(empty.expire(), Reply::Collected(Vec::new()));
    }

    #[test]
    fn test_single_and_any() {
        let mut ex = Exchange::new(Expect::One(Bytes::from_static(A)), MatchMode::All, Duration::from_secs(1));
        assert!(ex.offer(delivery(B, b"b")).is_none());
        assert_eq!(ex.offer(delivery(A, b"a")), Some(Reply::Single(Some(Decoded::raw(b"a")))));

        let mut any = Exchange::new(Expect::Any, MatchMode::All, Duration::from_secs(1));
        assert_eq!(any.offer(delivery(C, b"c")), Some(Reply::Single(Some(Decoded::raw(b"c")))));
        assert_eq!(
            Exchange::new(Expect::Any, MatchMode::All, Duration::ZERO).expire(),
            Reply::Single(None)
        );
    }
}
