//! QPACK header compression (RFC 9204), shared between the request-stream
//! codecs and the two QPACK control streams.
//!
//! Egress field sections are encoded against the static table only, so our
//! encoder stream never carries instructions and peers can never block on
//! us. Ingress supports the peer's dynamic table: encoder-stream inserts,
//! Required-Insert-Count blocking, and the decoder-stream instructions
//! (Section Acknowledgment, Stream Cancellation, Insert Count Increment)
//! that unblock the peer.
//!
//! Huffman-coded string literals are not produced and not accepted; header
//! compression beyond the table lookups is a codec concern, not a session
//! concern.

use std::collections::VecDeque;

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Errors produced by QPACK encoding or decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QpackError {
    #[error("invalid static table index")]
    InvalidStaticIndex,

    #[error("invalid dynamic table index")]
    InvalidDynamicIndex,

    #[error("huffman-coded literal not supported")]
    HuffmanUnsupported,

    #[error("prefix integer overflow")]
    IntegerOverflow,

    #[error("truncated header block")]
    Truncated,

    #[error("required insert count out of range")]
    InvalidRequiredInsertCount,

    #[error("dynamic table capacity exceeds the advertised maximum")]
    CapacityExceeded,
}

// ── QPACK prefix integer codec (RFC 9204 Section 4.1.1) ─────────────
//
// Different from QUIC varints. If the value fits in the N prefix bits
// (< 2^N - 1), encode directly; otherwise encode 2^N - 1 and the remainder
// in 7-bit continuation chunks.

pub(crate) fn encode_prefix_int(buf: &mut Vec<u8>, value: u64, prefix_bits: u8, pattern: u8) {
    let max = (1u64 << prefix_bits) - 1;
    if value < max {
        buf.push(pattern | value as u8);
    } else {
        buf.push(pattern | max as u8);
        let mut remaining = value - max;
        while remaining >= 128 {
            buf.push(0x80 | (remaining & 0x7f) as u8);
            remaining >>= 7;
        }
        buf.push(remaining as u8);
    }
}

pub(crate) fn decode_prefix_int(buf: &[u8], prefix_bits: u8) -> Option<(u64, usize)> {
    if buf.is_empty() {
        return None;
    }
    let max = (1u64 << prefix_bits) - 1;
    let value = u64::from(buf[0]) & max;
    if value < max {
        return Some((value, 1));
    }
    let mut value = max;
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        value += u64::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Some((value, i + 2));
        }
        if shift > 56 {
            return None;
        }
    }
    None
}

/// Encode a string literal: prefix int length (H bit clear) + raw bytes.
fn encode_string(buf: &mut Vec<u8>, s: &[u8], prefix_bits: u8, pattern: u8) {
    encode_prefix_int(buf, s.len() as u64, prefix_bits, pattern);
    buf.extend_from_slice(s);
}

/// Decode a string literal with the H bit at `1 << prefix_bits`.
///
/// `Ok(None)` means the buffer is incomplete.
fn decode_string(
    buf: &[u8],
    prefix_bits: u8,
) -> Result<Option<(Vec<u8>, usize)>, QpackError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] & (1 << prefix_bits) != 0 {
        return Err(QpackError::HuffmanUnsupported);
    }
    let (len, n) = match decode_prefix_int(buf, prefix_bits) {
        Some(v) => v,
        None => return Ok(None),
    };
    let len = len as usize;
    if buf.len() < n + len {
        return Ok(None);
    }
    Ok(Some((buf[n..n + len].to_vec(), n + len)))
}

// ── Static table (RFC 9204 Appendix A) ──────────────────────────────

/// QPACK static table entries: (name, value). 99 entries indexed 0..98.
const STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),
    (b":path", b"/"),
    (b"age", b"0"),
    (b"content-disposition", b""),
    (b"content-length", b"0"),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"referer", b""),
    (b"set-cookie", b""),
    (b":method", b"CONNECT"),
    (b":method", b"DELETE"),
    (b":method", b"GET"),
    (b":method", b"HEAD"),
    (b":method", b"OPTIONS"),
    (b":method", b"POST"),
    (b":method", b"PUT"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"103"),
    (b":status", b"200"),
    (b":status", b"304"),
    (b":status", b"404"),
    (b":status", b"503"),
    (b"accept", b"*/*"),
    (b"accept", b"application/dns-message"),
    (b"accept-encoding", b"gzip, deflate, br"),
    (b"accept-ranges", b"bytes"),
    (b"access-control-allow-headers", b"cache-control"),
    (b"access-control-allow-headers", b"content-type"),
    (b"access-control-allow-origin", b"*"),
    (b"cache-control", b"max-age=0"),
    (b"cache-control", b"max-age=2592000"),
    (b"cache-control", b"max-age=604800"),
    (b"cache-control", b"no-cache"),
    (b"cache-control", b"no-store"),
    (b"cache-control", b"public, max-age=31536000"),
    (b"content-encoding", b"br"),
    (b"content-encoding", b"gzip"),
    (b"content-type", b"application/dns-message"),
    (b"content-type", b"application/javascript"),
    (b"content-type", b"application/json"),
    (b"content-type", b"application/x-www-form-urlencoded"),
    (b"content-type", b"image/gif"),
    (b"content-type", b"image/jpeg"),
    (b"content-type", b"image/png"),
    (b"content-type", b"text/css"),
    (b"content-type", b"text/html; charset=utf-8"),
    (b"content-type", b"text/plain"),
    (b"content-type", b"text/plain;charset=utf-8"),
    (b"range", b"bytes=0-"),
    (b"strict-transport-security", b"max-age=31536000"),
    (b"strict-transport-security", b"max-age=31536000; includesubdomains"),
    (
        b"strict-transport-security",
        b"max-age=31536000; includesubdomains; preload",
    ),
    (b"vary", b"accept-encoding"),
    (b"vary", b"origin"),
    (b"x-content-type-options", b"nosniff"),
    (b"x-xss-protection", b"1; mode=block"),
    (b":status", b"100"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"302"),
    (b":status", b"400"),
    (b":status", b"403"),
    (b":status", b"421"),
    (b":status", b"425"),
    (b":status", b"500"),
    (b"accept-language", b""),
    (b"access-control-allow-credentials", b"FALSE"),
    (b"access-control-allow-credentials", b"TRUE"),
    (b"access-control-allow-headers", b"*"),
    (b"access-control-allow-methods", b"get"),
    (b"access-control-allow-methods", b"get, post, options"),
    (b"access-control-allow-methods", b"options"),
    (b"access-control-expose-headers", b"content-length"),
    (b"access-control-request-headers", b"content-type"),
    (b"access-control-request-method", b"get"),
    (b"access-control-request-method", b"post"),
    (b"alt-svc", b"clear"),
    (b"authorization", b""),
    (
        b"content-security-policy",
        b"script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    (b"early-data", b"1"),
    (b"expect-ct", b""),
    (b"forwarded", b""),
    (b"if-range", b""),
    (b"origin", b""),
    (b"purpose", b"prefetch"),
    (b"server", b""),
    (b"timing-allow-origin", b"*"),
    (b"upgrade-insecure-requests", b"1"),
    (b"user-agent", b""),
    (b"x-forwarded-for", b""),
    (b"x-frame-options", b"deny"),
    (b"x-frame-options", b"sameorigin"),
];

fn static_lookup(name: &[u8], value: &[u8]) -> (Option<usize>, Option<usize>) {
    let mut name_match = None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if *n == name {
            if *v == value {
                return (Some(i), Some(i));
            }
            if name_match.is_none() {
                name_match = Some(i);
            }
        }
    }
    (None, name_match)
}

// ── Shared codec state ──────────────────────────────────────────────

const ENTRY_OVERHEAD: u64 = 32;

fn entry_size(name: &[u8], value: &[u8]) -> u64 {
    ENTRY_OVERHEAD + name.len() as u64 + value.len() as u64
}

/// Result of decoding one field section.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// All referenced entries were available.
    Fields(Vec<HeaderField>),
    /// The section references dynamic entries not yet received; retry once
    /// `insert_count` reaches `required_insert_count`.
    Blocked { required_insert_count: u64 },
}

/// QPACK state shared by every request-stream codec and the encoder/decoder
/// control streams. Single-threaded; the session serializes all access.
pub struct QpackState {
    /// Peer-inserted dynamic entries, front = oldest surviving entry.
    table: VecDeque<HeaderField>,
    /// Absolute index of the front entry.
    evicted: u64,
    /// Total inserts received on the encoder stream.
    insert_count: u64,
    /// Inserts already covered by an emitted Insert Count Increment.
    acked_insert_count: u64,
    /// Current dynamic table capacity (set by the peer's encoder).
    capacity: u64,
    /// Upper bound on `capacity`: our SETTINGS_QPACK_MAX_TABLE_CAPACITY.
    max_capacity: u64,
    table_bytes: u64,
    /// Decoder-stream instructions waiting to be written (acks, cancels).
    pending_decoder_instructions: Vec<u8>,
}

impl QpackState {
    pub fn new(max_capacity: u64) -> Self {
        QpackState {
            table: VecDeque::new(),
            evicted: 0,
            insert_count: 0,
            acked_insert_count: 0,
            capacity: 0,
            max_capacity,
            table_bytes: 0,
            pending_decoder_instructions: Vec::new(),
        }
    }

    pub fn insert_count(&self) -> u64 {
        self.insert_count
    }

    pub fn set_max_capacity(&mut self, max: u64) {
        self.max_capacity = max;
    }

    fn max_entries(&self) -> u64 {
        self.max_capacity / ENTRY_OVERHEAD
    }

    fn get_absolute(&self, index: u64) -> Result<&HeaderField, QpackError> {
        if index < self.evicted || index >= self.insert_count {
            return Err(QpackError::InvalidDynamicIndex);
        }
        self.table
            .get((index - self.evicted) as usize)
            .ok_or(QpackError::InvalidDynamicIndex)
    }

    fn insert(&mut self, field: HeaderField) {
        let size = entry_size(&field.name, &field.value);
        while self.table_bytes + size > self.capacity {
            match self.table.pop_front() {
                Some(old) => {
                    self.table_bytes -= entry_size(&old.name, &old.value);
                    self.evicted += 1;
                }
                None => break,
            }
        }
        if size <= self.capacity {
            self.table_bytes += size;
            self.table.push_back(field);
        }
        // An entry too large to fit still counts as inserted; references to
        // it will fail, which the peer's encoder is required to avoid.
        self.insert_count += 1;
    }

    // ── Field section encoding (static table only) ──────────────────

    /// Encode a field section with Required Insert Count 0; never blocks
    /// the peer's decoder.
    pub fn encode_field_section(&self, fields: &[HeaderField]) -> Vec<u8> {
        let mut buf = Vec::new();
        // Prefix: Required Insert Count = 0, Delta Base = 0.
        buf.push(0x00);
        buf.push(0x00);
        for field in fields {
            match static_lookup(&field.name, &field.value) {
                (Some(i), _) => {
                    // Indexed field line, static (1 T=1 index<6>).
                    encode_prefix_int(&mut buf, i as u64, 6, 0xc0);
                }
                (None, Some(i)) => {
                    // Literal with static name reference (01 N=0 T=1 index<4>).
                    encode_prefix_int(&mut buf, i as u64, 4, 0x50);
                    encode_string(&mut buf, &field.value, 7, 0x00);
                }
                (None, None) => {
                    // Literal with literal name (001 N=0 H=0 len<3>).
                    encode_string(&mut buf, &field.name, 3, 0x20);
                    encode_string(&mut buf, &field.value, 7, 0x00);
                }
            }
        }
        buf
    }

    // ── Field section decoding ──────────────────────────────────────

    /// Decode a complete field section received on `stream_id`.
    ///
    /// Queues a Section Acknowledgment on the decoder stream when the
    /// section referenced the dynamic table.
    pub fn decode_field_section(
        &mut self,
        stream_id: u64,
        block: &[u8],
    ) -> Result<DecodeOutcome, QpackError> {
        let (enc_ric, n) =
            decode_prefix_int(block, 8).ok_or(QpackError::Truncated)?;
        let required_insert_count = self.reconstruct_insert_count(enc_ric)?;
        if required_insert_count > self.insert_count {
            return Ok(DecodeOutcome::Blocked {
                required_insert_count,
            });
        }
        let rest = &block[n..];
        if rest.is_empty() {
            return Err(QpackError::Truncated);
        }
        let sign_negative = rest[0] & 0x80 != 0;
        let (delta_base, m) = decode_prefix_int(rest, 7).ok_or(QpackError::Truncated)?;
        let base = if sign_negative {
            required_insert_count
                .checked_sub(delta_base + 1)
                .ok_or(QpackError::InvalidRequiredInsertCount)?
        } else {
            required_insert_count + delta_base
        };

        let mut fields = Vec::new();
        let mut buf = &rest[m..];
        while !buf.is_empty() {
            let first = buf[0];
            if first & 0x80 != 0 {
                // Indexed field line (1 T index<6>).
                let is_static = first & 0x40 != 0;
                let (index, n) = decode_prefix_int(buf, 6).ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                let field = if is_static {
                    let (name, value) = STATIC_TABLE
                        .get(index as usize)
                        .ok_or(QpackError::InvalidStaticIndex)?;
                    HeaderField::new(*name, *value)
                } else {
                    let absolute = base
                        .checked_sub(index + 1)
                        .ok_or(QpackError::InvalidDynamicIndex)?;
                    self.get_absolute(absolute)?.clone()
                };
                fields.push(field);
            } else if first & 0x40 != 0 {
                // Literal with name reference (01 N T index<4>).
                let is_static = first & 0x10 != 0;
                let (index, n) = decode_prefix_int(buf, 4).ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                let name = if is_static {
                    STATIC_TABLE
                        .get(index as usize)
                        .ok_or(QpackError::InvalidStaticIndex)?
                        .0
                        .to_vec()
                } else {
                    let absolute = base
                        .checked_sub(index + 1)
                        .ok_or(QpackError::InvalidDynamicIndex)?;
                    self.get_absolute(absolute)?.name.clone()
                };
                let (value, n) = decode_string(buf, 7)?.ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                fields.push(HeaderField { name, value });
            } else if first & 0x20 != 0 {
                // Literal with literal name (001 N H len<3>).
                let (name, n) = decode_string(buf, 3)?.ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                let (value, n) = decode_string(buf, 7)?.ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                fields.push(HeaderField { name, value });
            } else if first & 0x10 != 0 {
                // Indexed field line with post-base index (0001 index<4>).
                let (index, n) = decode_prefix_int(buf, 4).ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                fields.push(self.get_absolute(base + index)?.clone());
            } else {
                // Literal with post-base name reference (0000 N index<3>).
                let (index, n) = decode_prefix_int(buf, 3).ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                let name = self.get_absolute(base + index)?.name.clone();
                let (value, n) = decode_string(buf, 7)?.ok_or(QpackError::Truncated)?;
                buf = &buf[n..];
                fields.push(HeaderField { name, value });
            }
        }

        if required_insert_count > 0 {
            // Section Acknowledgment (1 stream-id<7>).
            encode_prefix_int(&mut self.pending_decoder_instructions, stream_id, 7, 0x80);
        }
        Ok(DecodeOutcome::Fields(fields))
    }

    /// RFC 9204 Section 4.5.1.1 Required Insert Count reconstruction.
    fn reconstruct_insert_count(&self, encoded: u64) -> Result<u64, QpackError> {
        if encoded == 0 {
            return Ok(0);
        }
        let max_entries = self.max_entries();
        let full_range = 2 * max_entries;
        if full_range == 0 || encoded > full_range {
            return Err(QpackError::InvalidRequiredInsertCount);
        }
        let max_value = self.insert_count + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut ric = max_wrapped + encoded - 1;
        if ric > max_value {
            if ric <= full_range {
                return Err(QpackError::InvalidRequiredInsertCount);
            }
            ric -= full_range;
        }
        if ric == 0 {
            return Err(QpackError::InvalidRequiredInsertCount);
        }
        Ok(ric)
    }

    // ── Encoder stream ingress (peer inserts) ───────────────────────

    /// Process bytes received on the peer's QPACK encoder stream.
    ///
    /// Returns how many bytes formed complete instructions; the remainder
    /// must be re-offered once more data arrives.
    pub fn on_encoder_stream_data(&mut self, buf: &[u8]) -> Result<usize, QpackError> {
        let mut consumed = 0;
        loop {
            let rest = &buf[consumed..];
            if rest.is_empty() {
                return Ok(consumed);
            }
            let first = rest[0];
            if first & 0x80 != 0 {
                // Insert with name reference (1 T index<6>).
                let is_static = first & 0x40 != 0;
                let (index, n) = match decode_prefix_int(rest, 6) {
                    Some(v) => v,
                    None => return Ok(consumed),
                };
                let value = match decode_string(&rest[n..], 7)? {
                    Some(v) => v,
                    None => return Ok(consumed),
                };
                let name = if is_static {
                    STATIC_TABLE
                        .get(index as usize)
                        .ok_or(QpackError::InvalidStaticIndex)?
                        .0
                        .to_vec()
                } else {
                    let absolute = self
                        .insert_count
                        .checked_sub(index + 1)
                        .ok_or(QpackError::InvalidDynamicIndex)?;
                    self.get_absolute(absolute)?.name.clone()
                };
                consumed += n + value.1;
                self.insert(HeaderField {
                    name,
                    value: value.0,
                });
            } else if first & 0x40 != 0 {
                // Insert with literal name (01 H len<5>).
                let name = match decode_string(rest, 5)? {
                    Some(v) => v,
                    None => return Ok(consumed),
                };
                let value = match decode_string(&rest[name.1..], 7)? {
                    Some(v) => v,
                    None => return Ok(consumed),
                };
                consumed += name.1 + value.1;
                self.insert(HeaderField {
                    name: name.0,
                    value: value.0,
                });
            } else if first & 0x20 != 0 {
                // Set dynamic table capacity (001 cap<5>).
                let (cap, n) = match decode_prefix_int(rest, 5) {
                    Some(v) => v,
                    None => return Ok(consumed),
                };
                if cap > self.max_capacity {
                    return Err(QpackError::CapacityExceeded);
                }
                consumed += n;
                self.capacity = cap;
                while self.table_bytes > self.capacity {
                    if let Some(old) = self.table.pop_front() {
                        self.table_bytes -= entry_size(&old.name, &old.value);
                        self.evicted += 1;
                    }
                }
            } else {
                // Duplicate (000 index<5>).
                let (index, n) = match decode_prefix_int(rest, 5) {
                    Some(v) => v,
                    None => return Ok(consumed),
                };
                let absolute = self
                    .insert_count
                    .checked_sub(index + 1)
                    .ok_or(QpackError::InvalidDynamicIndex)?;
                let field = self.get_absolute(absolute)?.clone();
                consumed += n;
                self.insert(field);
            }
        }
    }

    // ── Decoder stream ─────────────────────────────────────────────

    /// Process bytes received on the peer's QPACK decoder stream. With a
    /// static-only encoder there is no state to update; instructions are
    /// validated and discarded.
    pub fn on_decoder_stream_data(&mut self, buf: &[u8]) -> Result<usize, QpackError> {
        let mut consumed = 0;
        loop {
            let rest = &buf[consumed..];
            if rest.is_empty() {
                return Ok(consumed);
            }
            let prefix_bits = if rest[0] & 0x80 != 0 {
                7 // Section Acknowledgment
            } else if rest[0] & 0x40 != 0 {
                6 // Stream Cancellation
            } else {
                6 // Insert Count Increment
            };
            match decode_prefix_int(rest, prefix_bits) {
                Some((_, n)) => consumed += n,
                None => return Ok(consumed),
            }
        }
    }

    /// Queue a Stream Cancellation instruction for an aborted stream.
    pub fn cancel_stream(&mut self, stream_id: u64) {
        // Stream Cancellation (01 stream-id<6>).
        encode_prefix_int(&mut self.pending_decoder_instructions, stream_id, 6, 0x40);
    }

    /// Drain pending decoder-stream bytes: an Insert Count Increment for
    /// inserts not yet signalled, plus queued acks and cancellations.
    pub fn take_decoder_stream_bytes(&mut self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let increment = self.insert_count - self.acked_insert_count;
        if increment > 0 {
            // Insert Count Increment (00 increment<6>).
            encode_prefix_int(&mut out, increment, 6, 0x00);
            self.acked_insert_count = self.insert_count;
        }
        out.append(&mut self.pending_decoder_instructions);
        if out.is_empty() { None } else { Some(out) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_insert_literal(buf: &mut Vec<u8>, name: &[u8], value: &[u8]) {
        encode_string(buf, name, 5, 0x40);
        encode_string(buf, value, 7, 0x00);
    }

    fn encode_set_capacity(buf: &mut Vec<u8>, cap: u64) {
        encode_prefix_int(buf, cap, 5, 0x20);
    }

    #[test]
    fn static_only_round_trip() {
        let mut state = QpackState::new(0);
        let fields = vec![
            HeaderField::new(b":method".as_slice(), b"GET".as_slice()),
            HeaderField::new(b":path".as_slice(), b"/index.html".as_slice()),
            HeaderField::new(b"x-custom".as_slice(), b"yes".as_slice()),
        ];
        let block = state.encode_field_section(&fields);
        match state.decode_field_section(0, &block).unwrap() {
            DecodeOutcome::Fields(decoded) => assert_eq!(decoded, fields),
            DecodeOutcome::Blocked { .. } => panic!("static section blocked"),
        }
        // RIC 0: no section ack queued.
        assert!(state.take_decoder_stream_bytes().is_none());
    }

    #[test]
    fn blocked_until_insert_arrives() {
        let mut state = QpackState::new(4096);

        // Header block referencing dynamic entry 0 with RIC=1.
        let mut block = Vec::new();
        encode_prefix_int(&mut block, 1 + 1, 8, 0x00); // encoded RIC for ric=1
        block.push(0x00); // delta base 0, positive: base = 1
        encode_prefix_int(&mut block, 0, 6, 0x80); // indexed, dynamic, rel 0

        match state.decode_field_section(8, &block).unwrap() {
            DecodeOutcome::Blocked {
                required_insert_count,
            } => assert_eq!(required_insert_count, 1),
            DecodeOutcome::Fields(_) => panic!("expected blocked"),
        }

        // Encoder stream: set capacity then insert.
        let mut enc = Vec::new();
        encode_set_capacity(&mut enc, 1024);
        encode_insert_literal(&mut enc, b"x-dyn", b"v1");
        let consumed = state.on_encoder_stream_data(&enc).unwrap();
        assert_eq!(consumed, enc.len());
        assert_eq!(state.insert_count(), 1);

        match state.decode_field_section(8, &block).unwrap() {
            DecodeOutcome::Fields(fields) => {
                assert_eq!(
                    fields,
                    vec![HeaderField::new(b"x-dyn".as_slice(), b"v1".as_slice())]
                );
            }
            DecodeOutcome::Blocked { .. } => panic!("still blocked"),
        }

        // ICI (one insert) then the section ack for stream 8.
        let bytes = state.take_decoder_stream_bytes().unwrap();
        assert_eq!(bytes[0], 0x01); // Insert Count Increment of 1
        assert_eq!(bytes[1], 0x80 | 8); // Section Ack for stream 8
    }

    #[test]
    fn partial_encoder_instruction_not_consumed() {
        let mut state = QpackState::new(4096);
        let mut enc = Vec::new();
        encode_set_capacity(&mut enc, 1024);
        encode_insert_literal(&mut enc, b"x-dyn", b"value");
        // Offer all but the last byte: only Set Capacity completes.
        let consumed = state.on_encoder_stream_data(&enc[..enc.len() - 1]).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(state.insert_count(), 0);
        let consumed2 = state.on_encoder_stream_data(&enc[consumed..]).unwrap();
        assert_eq!(consumed + consumed2, enc.len());
        assert_eq!(state.insert_count(), 1);
    }

    #[test]
    fn capacity_above_maximum_rejected() {
        let mut state = QpackState::new(64);
        let mut enc = Vec::new();
        encode_set_capacity(&mut enc, 128);
        assert_eq!(
            state.on_encoder_stream_data(&enc),
            Err(QpackError::CapacityExceeded)
        );
    }

    #[test]
    fn stream_cancellation_queued() {
        let mut state = QpackState::new(0);
        state.cancel_stream(12);
        let bytes = state.take_decoder_stream_bytes().unwrap();
        assert_eq!(bytes, vec![0x40 | 12]);
    }

    #[test]
    fn eviction_keeps_size_bounded() {
        let mut state = QpackState::new(ENTRY_OVERHEAD * 2 + 16);
        let mut enc = Vec::new();
        encode_set_capacity(&mut enc, ENTRY_OVERHEAD * 2 + 16);
        encode_insert_literal(&mut enc, b"aaaa", b"1111");
        encode_insert_literal(&mut enc, b"bbbb", b"2222");
        encode_insert_literal(&mut enc, b"cccc", b"3333");
        state.on_encoder_stream_data(&enc).unwrap();
        assert_eq!(state.insert_count(), 3);
        // First entry evicted; referencing it must fail.
        assert!(state.get_absolute(0).is_err());
        assert!(state.get_absolute(2).is_ok());
    }
}
