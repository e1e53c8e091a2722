use bytes::Bytes;

/// Размер поля длины кадра (u32, big-endian).
pub const LENGTH_FIELD_LEN: usize = 4;
/// Размер поля длины тега (u16, big-endian).
pub const TAG_LENGTH_FIELD_LEN: usize = 2;
/// Максимальный размер тела кадра по умолчанию (64mb).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Один кадр на проводе: тег типа сообщения и сериализованная полезная
/// нагрузка.
///
/// Кадр неизменяем после создания. Префикс длины вычисляется при
/// кодировании:
///
/// ```text
/// [u32 длина][u16 длина тега][тег UTF-8][полезная нагрузка]
/// ```
///
/// Длина покрывает поле длины тега, сам тег и полезную нагрузку.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tag: String,
    payload: Bytes,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Frame {
    pub fn new(
        tag: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }

    /// Тег типа сообщения.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Полезная нагрузка кадра.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.tag, self.payload)
    }

    /// Размер тела кадра, то есть значение префикса длины.
    pub fn body_len(&self) -> usize {
        TAG_LENGTH_FIELD_LEN + self.tag.len() + self.payload.len()
    }

    /// Полный размер кадра на проводе.
    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_LEN + self.body_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths() {
        let frame = Frame::new("advertise", Bytes::from_static(b"abc"));
        assert_eq!(frame.body_len(), 2 + 9 + 3);
        assert_eq!(frame.encoded_len(), 4 + 2 + 9 + 3);

        let (tag, payload) = frame.into_parts();
        assert_eq!(tag, "advertise");
        assert_eq!(&payload[..], b"abc");
    }
}
