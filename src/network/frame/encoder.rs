use bytes::{BufMut, Bytes, BytesMut};
use simbus_error::FrameError;

use super::types::{Frame, DEFAULT_MAX_FRAME_LEN, LENGTH_FIELD_LEN};

/// Кодировщик кадров с ограничением размера.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    max_frame_len: usize,
}

impl FrameEncoder {
    /// Создаёт кодировщик. Предел не может превышать `u32::MAX`, так как
    /// длина передаётся 32-битным полем.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Кодирует кадр в новый буфер.
    pub fn encode(
        &self,
        frame: &Frame,
    ) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        self.encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Дописывает закодированный кадр в конец `dst`.
    ///
    /// При ошибке `dst` не изменяется.
    pub fn encode_into(
        &self,
        frame: &Frame,
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let tag = frame.tag().as_bytes();
        if tag.is_empty() {
            return Err(FrameError::MalformedFrame {
                reason: "empty tag".to_string(),
            });
        }
        if tag.len() > u16::MAX as usize {
            return Err(FrameError::TagTooLong { len: tag.len() });
        }

        let body_len = frame.body_len();
        if body_len > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_len,
            });
        }

        dst.reserve(LENGTH_FIELD_LEN + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u16(tag.len() as u16);
        dst.extend_from_slice(tag);
        dst.extend_from_slice(frame.payload());
        Ok(())
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет точную раскладку байт кадра.
    #[test]
    fn test_wire_layout() {
        let frame = Frame::new("sub", Bytes::from_static(b"\x01\x02"));
        let bytes = FrameEncoder::default().encode(&frame).unwrap();

        assert_eq!(
            &bytes[..],
            &[0, 0, 0, 7, 0, 3, b's', b'u', b'b', 0x01, 0x02][..]
        );
    }

    #[test]
    fn test_empty_payload_is_allowed() {
        let frame = Frame::new("version_init", Bytes::new());
        let bytes = FrameEncoder::default().encode(&frame).unwrap();
        assert_eq!(bytes.len(), frame.encoded_len());
    }

    #[test]
    fn test_rejects_empty_tag() {
        let frame = Frame::new("", Bytes::from_static(b"x"));
        let err = FrameEncoder::default().encode(&frame).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame { .. }));
    }

    /// Тест проверяет, что слишком большой кадр не попадает в буфер.
    #[test]
    fn test_rejects_oversized_frame() {
        let encoder = FrameEncoder::new(16);
        let frame = Frame::new("data", vec![0u8; 32]);
        let mut dst = BytesMut::new();

        let err = encoder.encode_into(&frame, &mut dst).unwrap_err();
        assert_eq!(err, FrameError::FrameTooLarge { size: 38, max: 16 });
        assert!(dst.is_empty());
    }

    #[test]
    fn test_rejects_long_tag() {
        let frame = Frame::new("t".repeat(70_000), Bytes::new());
        let err = FrameEncoder::new(1 << 20).encode(&frame).unwrap_err();
        assert_eq!(err, FrameError::TagTooLong { len: 70_000 });
    }
}
