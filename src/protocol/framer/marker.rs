use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Begin,
    End,
}

/// Fixed byte pattern expected at a known offset of a datagram.
///
/// Begin markers are matched at `offset` relative to the datagram start. The
/// end marker is searched from `offset` onwards; its position terminates the
/// datagram. Exclusive markers are stripped from the extracted bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    bytes: Bytes,
    offset: usize,
    kind: MarkerKind,
    exclusive: bool,
}

/// Outcome of comparing a marker against buffered bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Full,
    /// Every available byte matches but the buffer ends before the marker does
    Partial,
    Mismatch,
}

impl Marker {
    pub fn begin(bytes: &'static [u8], offset: usize) -> Self {
        Self {
            bytes: Bytes::from_static(bytes),
            offset,
            kind: MarkerKind::Begin,
            exclusive: false,
        }
    }

    pub fn end(bytes: &'static [u8], min_offset: usize) -> Self {
        Self {
            kind: MarkerKind::End,
            ..Self::begin(bytes, min_offset)
        }
    }

    /// Strip this marker's bytes from extracted datagrams
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn kind(&self) -> MarkerKind {
        self.kind
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes from datagram start through the end of this marker
    #[inline]
    pub fn extent(&self) -> usize {
        self.offset + self.bytes.len()
    }

    /// Compare against `buf` assuming the datagram starts at `start`
    pub fn match_at(&self, buf: &[u8], start: usize) -> MatchState {
        let pos = start + self.offset;
        let available = buf.len().saturating_sub(pos).min(self.bytes.len());
        if available > 0 && buf[pos..pos + available] != self.bytes[..available] {
            return MatchState::Mismatch;
        }
        if available == self.bytes.len() {
            MatchState::Full
        } else {
            MatchState::Partial
        }
    }

    /// Position (relative to `start`) of the first occurrence at or after the
    /// marker offset
    pub fn find_from(&self, buf: &[u8], start: usize) -> Option<usize> {
        let from = start + self.offset;
        if self.bytes.is_empty() || buf.len() < from + self.bytes.len() {
            return None;
        }
        buf[from..]
            .windows(self.bytes.len())
            .position(|w| w == &self.bytes[..])
            .map(|p| p + self.offset)
    }
}
