//! UDP packet framing and reliable delivery.
//!
//! A decrypted packet is `[direction:1][msg_count:1][transport_msg...]`.
//! Each transport message is one of:
//!
//!   - `0x01` ACK:      `[0x01][seq][0x00][flags]` -- fixed 4 bytes.
//!   - `0x32` Reliable: `[0x32][totalLen][flags][seqHi][seqLo][payload...]`.
//!   - anything else:  `[type][totalLen][payload...]`.
//!
//! This module only frames and reframes bytes; it has no opinion on what a
//! game-layer payload means.

use crate::codec::Cursor;

pub const DIR_SERVER: u8 = 0x01;
pub const DIR_CLIENT: u8 = 0x02;
pub const DIR_INIT: u8 = 0xFF;

pub const MAX_PACKET_SIZE: usize = 512;
const MAX_MSGS_PER_PACKET: usize = 32;

pub(crate) const MSG_ACK: u8 = 0x01;
pub(crate) const MSG_RELIABLE: u8 = 0x32;

pub const RELIABLE_FLAG_GUARANTEED: u8 = 0x01;
pub const RELIABLE_FLAG_FRAGMENT: u8 = 0x20;
/// The actual packet builder in the original server hardcodes this value in
/// the flags byte of every reliable message rather than
/// `RELIABLE_FLAG_GUARANTEED`; kept as the wire-true constant.
pub const RELIABLE_FLAG_WIRE: u8 = 0x80;

/// A single parsed transport message, borrowing its payload from the
/// packet buffer it was parsed out of.
#[derive(Debug)]
pub struct TransportMsg<'a> {
    pub msg_type: u8,
    pub flags: u8,
    pub seq: u16,
    pub payload: &'a [u8],
}

/// All transport messages carried by one incoming packet.
#[derive(Debug)]
pub struct Packet<'a> {
    pub direction: u8,
    pub msgs: Vec<TransportMsg<'a>>,
}

/// Parses an already-decrypted packet. Returns `None` on any malformed
/// framing (truncated header, a message claiming a length past the end of
/// the buffer, more messages than fit in one packet).
pub fn parse(data: &[u8]) -> Option<Packet<'_>> {
    if data.len() < 2 {
        return None;
    }
    let direction = data[0];
    let msg_count = data[1] as usize;
    if msg_count > MAX_MSGS_PER_PACKET {
        return None;
    }

    let mut msgs = Vec::with_capacity(msg_count);
    let mut pos = 2usize;

    for _ in 0..msg_count {
        if pos >= data.len() {
            return None;
        }
        let msg_type = data[pos];

        if msg_type == MSG_ACK {
            if pos + 4 > data.len() {
                return None;
            }
            let seq = data[pos + 1] as u16;
            let flags = data[pos + 3];
            msgs.push(TransportMsg {
                msg_type,
                flags,
                seq,
                payload: &data[pos + 4..pos + 4],
            });
            pos += 4;
        } else if msg_type == MSG_RELIABLE {
            if pos + 5 > data.len() {
                return None;
            }
            let total_len = data[pos + 1] as usize;
            if total_len < 5 {
                return None;
            }
            let flags = data[pos + 2];
            let seq = ((data[pos + 3] as u16) << 8) | data[pos + 4] as u16;
            let end = pos + total_len;
            if end > data.len() {
                return None;
            }
            msgs.push(TransportMsg {
                msg_type,
                flags,
                seq,
                payload: &data[pos + 5..end],
            });
            pos = end;
        } else {
            if pos + 2 > data.len() {
                return None;
            }
            let total_len = data[pos + 1] as usize;
            if total_len < 2 {
                return None;
            }
            let end = pos + total_len;
            if end > data.len() {
                return None;
            }
            msgs.push(TransportMsg {
                msg_type,
                flags: 0,
                seq: 0,
                payload: &data[pos + 2..end],
            });
            pos = end;
        }
    }

    Some(Packet { direction, msgs })
}

fn write_header(cur: &mut Cursor<'_>, direction: u8, msg_count: u8) -> bool {
    cur.write_u8(direction) && cur.write_u8(msg_count)
}

/// Builds a packet carrying a single unreliable game message under the
/// generic type `0x00`. Returns the total packet length, or `None` if
/// `out` is too small or the message doesn't fit in a `u8` length.
pub fn build_unreliable(out: &mut [u8], direction: u8, payload: &[u8]) -> Option<usize> {
    build_message(out, direction, 0x00, payload)
}

/// Builds a packet carrying one already-typed game message
/// (`[type][totalLen][payload]`), unreliable.
pub fn build_message(out: &mut [u8], direction: u8, msg_type: u8, payload: &[u8]) -> Option<usize> {
    let body_len = 2 + payload.len();
    if body_len > 255 {
        return None;
    }
    let total_len = 2 + body_len;
    if out.len() < total_len {
        return None;
    }
    let mut cur = Cursor::new(out);
    if !write_header(&mut cur, direction, 1) {
        return None;
    }
    if !cur.write_u8(msg_type) || !cur.write_u8(body_len as u8) || !cur.write_bytes(payload) {
        return None;
    }
    Some(cur.position())
}

/// Builds a packet carrying a single reliable game message, wrapped in the
/// `0x32` reliable envelope.
pub fn build_reliable(
    out: &mut [u8],
    direction: u8,
    payload: &[u8],
    seq: u16,
    flags: u8,
) -> Option<usize> {
    let body_len = 5 + payload.len();
    if body_len > 255 {
        return None;
    }
    let total_len = 2 + body_len;
    if out.len() < total_len {
        return None;
    }
    let mut cur = Cursor::new(out);
    if !write_header(&mut cur, direction, 1) {
        return None;
    }
    if !cur.write_u8(MSG_RELIABLE) || !cur.write_u8(body_len as u8) || !cur.write_u8(flags) {
        return None;
    }
    if !cur.write_u8((seq >> 8) as u8) || !cur.write_u8((seq & 0xFF) as u8) {
        return None;
    }
    if !cur.write_bytes(payload) {
        return None;
    }
    Some(cur.position())
}

/// Builds an ACK packet for a received reliable message.
pub fn build_ack(out: &mut [u8], direction: u8, seq: u16, flags: u8) -> Option<usize> {
    if out.len() < 6 {
        return None;
    }
    let mut cur = Cursor::new(out);
    if !write_header(&mut cur, direction, 1) {
        return None;
    }
    if !cur.write_u8(MSG_ACK) || !cur.write_u8(seq as u8) || !cur.write_u8(0x00) || !cur.write_u8(flags)
    {
        return None;
    }
    Some(cur.position())
}

/// Batches several already-framed transport messages (each produced by
/// writing directly past the shared 2-byte header) into one packet. Used by
/// the handshake, which sends a CONNECT-ack and a ChecksumReq together.
pub struct Batcher<'a> {
    out: &'a mut [u8],
    pos: usize,
    count: u8,
}

impl<'a> Batcher<'a> {
    pub fn new(out: &'a mut [u8], direction: u8) -> Option<Self> {
        if out.len() < 2 {
            return None;
        }
        out[0] = direction;
        out[1] = 0;
        Some(Batcher { out, pos: 2, count: 0 })
    }

    /// Appends a raw, already-built transport message (type+len+body, or
    /// the fixed 4-byte ACK shape) to the batch.
    pub fn push_raw(&mut self, bytes: &[u8]) -> bool {
        if self.pos + bytes.len() > self.out.len() {
            return false;
        }
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.count += 1;
        true
    }

    pub fn push_message(&mut self, msg_type: u8, payload: &[u8]) -> bool {
        let body_len = 2 + payload.len();
        if body_len > 255 {
            return false;
        }
        let mut tmp = [0u8; 255];
        tmp[0] = msg_type;
        tmp[1] = body_len as u8;
        tmp[2..2 + payload.len()].copy_from_slice(payload);
        self.push_raw(&tmp[..body_len])
    }

    pub fn push_reliable(&mut self, payload: &[u8], seq: u16, flags: u8) -> bool {
        let body_len = 5 + payload.len();
        if body_len > 255 {
            return false;
        }
        let mut tmp = [0u8; 255];
        tmp[0] = MSG_RELIABLE;
        tmp[1] = body_len as u8;
        tmp[2] = flags;
        tmp[3] = (seq >> 8) as u8;
        tmp[4] = (seq & 0xFF) as u8;
        tmp[5..5 + payload.len()].copy_from_slice(payload);
        self.push_raw(&tmp[..body_len])
    }

    /// Finalizes the batch, writing the message count into the header and
    /// returning the total packet length.
    pub fn finish(self) -> usize {
        self.out[1] = self.count;
        self.pos
    }
}

/// Tracks one outgoing reliable message awaiting acknowledgement.
#[derive(Clone)]
struct ReliableEntry {
    payload: Vec<u8>,
    seq: u16,
    send_time: u32,
    retries: u8,
    active: bool,
}

impl ReliableEntry {
    fn empty() -> Self {
        ReliableEntry {
            payload: Vec::new(),
            seq: 0,
            send_time: 0,
            retries: 0,
            active: false,
        }
    }
}

pub const RELIABLE_QUEUE_SIZE: usize = 16;
pub const RELIABLE_MAX_PAYLOAD: usize = 512;
pub const RELIABLE_RETRANSMIT_MS: u32 = 2000;
pub const RELIABLE_MAX_RETRIES: u8 = 8;

/// Fixed-size ring of unACKed outgoing reliable messages, one per peer.
pub struct ReliableQueue {
    entries: [ReliableEntry; RELIABLE_QUEUE_SIZE],
    count: usize,
}

impl ReliableQueue {
    pub fn new() -> Self {
        ReliableQueue {
            entries: [
                ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(),
                ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(),
                ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(),
                ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(), ReliableEntry::empty(),
            ],
            count: 0,
        }
    }

    /// Adds a message to the queue. Fails if the payload is too large or
    /// the queue is full.
    pub fn add(&mut self, payload: &[u8], seq: u16, now_ms: u32) -> bool {
        if payload.len() > RELIABLE_MAX_PAYLOAD {
            return false;
        }
        let slot = self.entries.iter().position(|e| !e.active);
        let idx = match slot {
            Some(i) => i,
            None => return false,
        };
        self.entries[idx] = ReliableEntry {
            payload: payload.to_vec(),
            seq,
            send_time: now_ms,
            retries: 0,
            active: true,
        };
        self.count += 1;
        true
    }

    /// Marks a message acknowledged, removing it from the queue.
    pub fn ack(&mut self, seq: u16) -> bool {
        for e in self.entries.iter_mut() {
            if e.active && e.seq == seq {
                *e = ReliableEntry::empty();
                self.count -= 1;
                return true;
            }
        }
        false
    }

    /// Returns the payload and seq of the next entry due for retransmit,
    /// bumping its send time and retry count. Call repeatedly (each call
    /// checks a single entry, matching the original's one-scan-per-call
    /// scheduling) until it returns `None`.
    pub fn check_retransmit(&mut self, now_ms: u32) -> Option<(Vec<u8>, u16)> {
        for e in self.entries.iter_mut() {
            if !e.active {
                continue;
            }
            if now_ms.wrapping_sub(e.send_time) >= RELIABLE_RETRANSMIT_MS {
                e.send_time = now_ms;
                e.retries += 1;
                return Some((e.payload.clone(), e.seq));
            }
        }
        None
    }

    /// True if any entry has exceeded the retry budget; the peer should be
    /// considered dead.
    pub fn check_timeout(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.active && e.retries > RELIABLE_MAX_RETRIES)
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

/// Reassembles a fragmented reliable message. The first fragment's payload
/// byte 0 names the total fragment count (must be >= 2); continuation
/// fragments carry their own index in byte 0, used only for logging -- the
/// original reassembles strictly in arrival order and trusts the sender's
/// framing rather than reordering by index.
pub struct Reassembler {
    buf: Vec<u8>,
    total_frags: Option<u8>,
    received: u8,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            buf: Vec::new(),
            total_frags: None,
            received: 0,
        }
    }

    /// Feeds one fragment's payload (the bytes after the `RELIABLE_FLAG_FRAGMENT`
    /// envelope, index byte included). Returns the fully reassembled payload
    /// once the declared fragment count has been received.
    pub fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        if fragment.is_empty() {
            return None;
        }
        let marker = fragment[0];
        let body = &fragment[1..];

        if self.total_frags.is_none() {
            if marker < 2 {
                return None;
            }
            self.total_frags = Some(marker);
            self.buf.clear();
            self.received = 0;
        }

        self.buf.extend_from_slice(body);
        self.received += 1;

        if self.received >= self.total_frags.unwrap() {
            let out = std::mem::take(&mut self.buf);
            self.total_frags = None;
            self.received = 0;
            Some(out)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.total_frags = None;
        self.received = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generic_message() {
        let packet = [DIR_SERVER, 1, 0x00, 0x03, 0xAB];
        let parsed = parse(&packet).unwrap();
        assert_eq!(parsed.direction, DIR_SERVER);
        assert_eq!(parsed.msgs.len(), 1);
        assert_eq!(parsed.msgs[0].msg_type, 0x00);
        assert_eq!(parsed.msgs[0].payload, &[0xAB]);
    }

    #[test]
    fn parses_ack() {
        let packet = [DIR_CLIENT, 1, MSG_ACK, 7, 0x00, RELIABLE_FLAG_WIRE];
        let parsed = parse(&packet).unwrap();
        assert_eq!(parsed.msgs[0].seq, 7);
        assert_eq!(parsed.msgs[0].flags, RELIABLE_FLAG_WIRE);
    }

    #[test]
    fn parses_reliable() {
        let mut out = [0u8; 32];
        let len = build_reliable(&mut out, DIR_SERVER, &[1, 2, 3], 0x0102, RELIABLE_FLAG_WIRE).unwrap();
        let parsed = parse(&out[..len]).unwrap();
        assert_eq!(parsed.msgs[0].msg_type, MSG_RELIABLE);
        assert_eq!(parsed.msgs[0].seq, 0x0102);
        assert_eq!(parsed.msgs[0].payload, &[1, 2, 3]);
    }

    #[test]
    fn rejects_truncated_packet() {
        let packet = [DIR_SERVER, 1, MSG_RELIABLE, 9];
        assert!(parse(&packet).is_none());
    }

    #[test]
    fn batcher_combines_two_messages() {
        let mut out = [0u8; 64];
        let mut b = Batcher::new(&mut out, DIR_SERVER).unwrap();
        assert!(b.push_message(0x03, &[0xC0, 0x00, 0x00, 0x01]));
        assert!(b.push_reliable(&[0x20, 0x00], 1, RELIABLE_FLAG_WIRE));
        let len = b.finish();
        let parsed = parse(&out[..len]).unwrap();
        assert_eq!(parsed.msgs.len(), 2);
        assert_eq!(parsed.msgs[0].msg_type, 0x03);
        assert_eq!(parsed.msgs[1].msg_type, MSG_RELIABLE);
    }

    #[test]
    fn reliable_queue_add_ack_roundtrip() {
        let mut q = ReliableQueue::new();
        assert!(q.add(&[1, 2, 3], 1, 0));
        assert_eq!(q.len(), 1);
        assert!(q.ack(1));
        assert_eq!(q.len(), 0);
        assert!(!q.ack(1));
    }

    #[test]
    fn reliable_queue_retransmits_after_deadline() {
        let mut q = ReliableQueue::new();
        q.add(&[9], 5, 0);
        assert!(q.check_retransmit(1000).is_none());
        let (payload, seq) = q.check_retransmit(RELIABLE_RETRANSMIT_MS).unwrap();
        assert_eq!(payload, vec![9]);
        assert_eq!(seq, 5);
    }

    #[test]
    fn reliable_queue_times_out_after_max_retries() {
        let mut q = ReliableQueue::new();
        q.add(&[9], 5, 0);
        let mut now = 0;
        for _ in 0..=RELIABLE_MAX_RETRIES {
            now += RELIABLE_RETRANSMIT_MS;
            q.check_retransmit(now);
        }
        assert!(q.check_timeout());
    }

    #[test]
    fn reassembles_two_fragments() {
        let mut r = Reassembler::new();
        assert!(r.push(&[2, 1, 2, 3]).is_none());
        let whole = r.push(&[1, 4, 5, 6]).unwrap();
        assert_eq!(whole, vec![1, 2, 3, 4, 5, 6]);
    }
}
