use bytes::{Buf, BytesMut};
use simbus_error::FrameError;

use super::types::{Frame, DEFAULT_MAX_FRAME_LEN, LENGTH_FIELD_LEN, TAG_LENGTH_FIELD_LEN};

/// Сколько места под тело резервируется сразу после заголовка. Остальное
/// буфер добирает по мере прихода байтов.
const MAX_BODY_PREALLOC: usize = 64 * 1024;

/// Состояние инкрементального декодера.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeState {
    /// Ожидается префикс длины.
    Header,
    /// Префикс прочитан, ожидается тело указанной длины.
    Body { len: usize },
}

/// Декодер потока кадров.
///
/// Байты из сокета накапливаются в `BytesMut`, а `decode` забирает из него
/// ровно один кадр, как только тот доступен целиком. Кадр, разрезанный на
/// произвольное число чтений, собирается без повторного разбора заголовка.
#[derive(Debug)]
pub struct FrameDecoder {
    state: FrameDecodeState,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            state: FrameDecodeState::Header,
            max_frame_len,
        }
    }

    pub fn state(&self) -> FrameDecodeState {
        self.state
    }

    /// Пытается извлечь следующий кадр из `buf`.
    ///
    /// # Возвращает
    /// - `Ok(Some(frame))`: кадр собран и удалён из буфера
    /// - `Ok(None)`: данных пока недостаточно
    /// - `Err(FrameError)`: поток повреждён, соединение нужно закрыть
    pub fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Frame>, FrameError> {
        let len = match self.state {
            FrameDecodeState::Header => {
                if buf.len() < LENGTH_FIELD_LEN {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if len > self.max_frame_len {
                    return Err(FrameError::FrameTooLarge {
                        size: len,
                        max: self.max_frame_len,
                    });
                }
                if len < TAG_LENGTH_FIELD_LEN {
                    return Err(FrameError::MalformedFrame {
                        reason: format!("frame length {len} is shorter than the tag header"),
                    });
                }
                buf.advance(LENGTH_FIELD_LEN);
                buf.reserve(len.saturating_sub(buf.len()).min(MAX_BODY_PREALLOC));
                self.state = FrameDecodeState::Body { len };
                len
            }
            FrameDecodeState::Body { len } => len,
        };

        if buf.len() < len {
            return Ok(None);
        }

        self.state = FrameDecodeState::Header;
        let mut body = buf.split_to(len).freeze();

        let tag_len = body.get_u16() as usize;
        if tag_len == 0 {
            return Err(FrameError::MalformedFrame {
                reason: "empty tag".to_string(),
            });
        }
        if tag_len > body.remaining() {
            return Err(FrameError::MalformedFrame {
                reason: format!(
                    "tag length {tag_len} exceeds frame body of {} bytes",
                    body.remaining()
                ),
            });
        }

        let tag_bytes = body.split_to(tag_len);
        let tag = std::str::from_utf8(&tag_bytes)
            .map_err(|e| FrameError::MalformedFrame {
                reason: format!("tag is not valid UTF-8: {e}"),
            })?
            .to_string();

        Ok(Some(Frame::new(tag, body)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes};
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::network::frame::FrameEncoder;

    fn encode(frame: &Frame) -> Bytes {
        FrameEncoder::default().encode(frame).unwrap()
    }

    /// Подаёт байты в декодер кусками, разрезанными в точках `cuts`, и
    /// возвращает все собранные кадры.
    fn feed_in_pieces(
        bytes: &[u8],
        cuts: &[usize],
    ) -> Vec<Frame> {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        let mut start = 0;

        let mut points: Vec<usize> = cuts.to_vec();
        points.push(bytes.len());
        points.sort_unstable();

        for end in points {
            buf.extend_from_slice(&bytes[start..end]);
            start = end;
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert!(buf.is_empty());
        frames
    }

    /// Тест проверяет, что кодирование и декодирование сохраняют нагрузку
    /// любых размеров, включая пустую.
    #[test]
    fn test_roundtrip_payload_sizes() {
        for size in [0usize, 1, 255, 4096, 65_537] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let frame = Frame::new("data", payload);
            let frames = feed_in_pieces(&encode(&frame), &[]);
            assert_eq!(frames, vec![frame]);
        }
    }

    /// Тест проверяет сборку кадра, разрезанного на 1, 2 и N частей.
    #[rstest]
    #[case::single_chunk(1)]
    #[case::two_chunks(2)]
    #[case::three_chunks(3)]
    #[case::byte_by_byte(usize::MAX)]
    fn test_reassembly_across_chunks(#[case] chunks: usize) {
        let frame = Frame::new("publisher_subscribe", vec![7u8; 100]);
        let bytes = encode(&frame);

        let chunk_size = bytes.len().div_ceil(chunks.min(bytes.len())).max(1);
        let cuts: Vec<usize> = (1..bytes.len())
            .filter(|i| i % chunk_size == 0)
            .collect();

        let frames = feed_in_pieces(&bytes, &cuts);
        assert_eq!(frames, vec![frame]);
    }

    /// Тест проверяет, что несколько кадров в одном чтении извлекаются по
    /// порядку.
    #[test]
    fn test_multiple_frames_in_one_read() {
        let a = Frame::new("advertise", Bytes::from_static(b"one"));
        let b = Frame::new("subscribe", Bytes::new());
        let c = Frame::new("sub", Bytes::from_static(b"three"));

        let mut all = BytesMut::new();
        for frame in [&a, &b, &c] {
            all.extend_from_slice(&encode(frame));
        }

        let frames = feed_in_pieces(&all, &[]);
        assert_eq!(frames, vec![a, b, c]);
    }

    #[test]
    fn test_partial_header_waits() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(decoder.state(), FrameDecodeState::Header);

        buf.extend_from_slice(&[0, 9, 0]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(decoder.state(), FrameDecodeState::Body { len: 9 });
    }

    /// Тест проверяет, что заявленная длина тела не резервируется целиком
    /// до прихода самих байтов.
    #[test]
    fn test_header_does_not_preallocate_whole_body() {
        let len = 16 * 1024 * 1024;
        let mut decoder = FrameDecoder::new(len);
        let mut buf = BytesMut::new();
        buf.put_u32(len as u32);

        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(decoder.state(), FrameDecodeState::Body { len });
        assert!(buf.capacity() < 1024 * 1024, "capacity {}", buf.capacity());
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut decoder = FrameDecoder::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err, FrameError::FrameTooLarge { size: 9, max: 8 });
    }

    #[test]
    fn test_rejects_length_shorter_than_tag_header() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::MalformedFrame { .. })
        ));
    }

    /// Тест проверяет, что длина тега, выходящая за тело кадра, считается
    /// повреждением потока.
    #[test]
    fn test_rejects_tag_longer_than_body() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u16(10);
        buf.put_slice(b"ab");
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn test_rejects_invalid_utf8_and_empty_tags() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u16(2);
        buf.put_slice(&[0xff, 0xfe]);
        assert!(matches!(
            FrameDecoder::default().decode(&mut buf),
            Err(FrameError::MalformedFrame { .. })
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u16(0);
        buf.put_u8(1);
        assert!(matches!(
            FrameDecoder::default().decode(&mut buf),
            Err(FrameError::MalformedFrame { .. })
        ));
    }

    proptest! {
        /// Произвольные точки разреза дают ровно один кадр, идентичный
        /// исходному.
        #[test]
        fn prop_any_split_yields_identical_frame(
            tag in "[a-z_]{1,24}",
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let frame = Frame::new(tag, payload);
            let bytes = encode(&frame);
            let cuts: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len())).collect();

            let frames = feed_in_pieces(&bytes, &cuts);
            prop_assert_eq!(frames, vec![frame]);
        }
    }
}
