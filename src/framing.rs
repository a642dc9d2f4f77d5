/// Length-prefixed message defragmenter.
///
/// Every frame is `<1-byte code><4-byte length (includes itself)><payload>`,
/// except the very first frame of a session (StartupMessage or SSLRequest),
/// which has no code byte, just `<4-byte length><payload>`. The buffer
/// tracks `has_started` itself so callers don't need to re-derive framing
/// mode on every `push`.
use bytes::{Buf, Bytes, BytesMut};

/// A single complete frame pulled off the wire.
pub struct RawMessage {
    /// `None` for the codeless first frame.
    pub code: Option<u8>,
    pub payload: Bytes,
}

pub struct MessageBuffer {
    buf: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        MessageBuffer {
            buf: BytesMut::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Empties any pending bytes. Called after a TLS upgrade, since framing
    /// resets to "awaiting the codeless first frame" on the new stream.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes accumulated so far that have not yet formed a complete message.
    /// Exposed so `Connection::detach` can hand them back to the caller
    /// instead of discarding them silently.
    pub fn residual(&self) -> &[u8] {
        &self.buf
    }

    /// Attempts to pull one complete message out of the buffer. Returns
    /// `None` (without consuming anything) if fewer bytes than the declared
    /// length are currently available.
    pub fn poll(&mut self, has_started: bool) -> Option<RawMessage> {
        if has_started {
            self.poll_coded()
        } else {
            self.poll_codeless()
        }
    }

    fn poll_codeless(&mut self) -> Option<RawMessage> {
        if self.buf.len() < 4 {
            return None;
        }

        let len = i32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len < 4 || self.buf.len() < len {
            return None;
        }

        self.buf.advance(4);
        let payload = self.buf.split_to(len - 4).freeze();

        Some(RawMessage {
            code: None,
            payload,
        })
    }

    fn poll_coded(&mut self) -> Option<RawMessage> {
        if self.buf.len() < 5 {
            return None;
        }

        let code = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len < 4 || self.buf.len() < 1 + len {
            return None;
        }

        self.buf.advance(5);
        let payload = self.buf.split_to(len - 4).freeze();

        Some(RawMessage {
            code: Some(code),
            payload,
        })
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_nothing_until_full_length_arrives() {
        let mut mb = MessageBuffer::new();
        mb.push(&[0, 0, 0, 8]);
        assert!(mb.poll(false).is_none());
        mb.push(&[1, 2, 3, 4]);
        let msg = mb.poll(false).unwrap();
        assert_eq!(msg.code, None);
        assert_eq!(&msg.payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn handles_coded_frames_after_startup() {
        let mut mb = MessageBuffer::new();
        mb.push(b"Q");
        mb.push(&[0, 0, 0, 9]);
        mb.push(b"sel\0");
        let msg = mb.poll(true).unwrap();
        assert_eq!(msg.code, Some(b'Q'));
        assert_eq!(&msg.payload[..], b"sel\0");
    }

    #[test]
    fn arbitrary_chunking_yields_same_messages() {
        let whole: Vec<u8> = {
            let mut v = vec![b'Q'];
            v.extend_from_slice(&9i32.to_be_bytes());
            v.extend_from_slice(b"sel\0");
            v
        };

        for split in 0..whole.len() {
            let mut mb = MessageBuffer::new();
            mb.push(&whole[..split]);
            mb.push(&whole[split..]);
            let msg = mb.poll(true).unwrap();
            assert_eq!(msg.code, Some(b'Q'));
            assert_eq!(&msg.payload[..], b"sel\0");
        }
    }
}
