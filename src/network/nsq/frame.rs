use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use nsqlink_error::{NsqError, NsqResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Тело ответа nsqd на heartbeat.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
/// Подтверждение `CLS` со стороны nsqd.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";
pub const OK: &[u8] = b"OK";

/// Размер поля `frameType`.
const TYPE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

/// Разобранный кадр. Живёт ровно до передачи делегату.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub body: Bytes,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Frame {
    pub fn new(
        frame_type: FrameType,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            frame_type,
            body: body.into(),
        }
    }

    /// Декодирует кадр из непрерывного буфера.
    ///
    /// # Параметры
    /// - `buf`: `[4 байта BE size][4 байта BE type][size-4 байт тела]`.
    ///
    /// # Возвращает
    /// `ProtocolError`, если в буфере меньше 4 байт, размер меньше длины
    /// поля типа, тело обрезано или тип кадра неизвестен.
    pub fn decode(mut buf: &[u8]) -> NsqResult<Frame> {
        if buf.len() < 4 {
            return Err(NsqError::protocol(format!(
                "frame too short: {} bytes",
                buf.len()
            ))
            .into());
        }
        let size = buf.get_u32() as usize;
        if size < TYPE_LEN || buf.len() < size {
            return Err(NsqError::protocol(format!(
                "bad frame size {size}, {} bytes available",
                buf.len()
            ))
            .into());
        }
        let frame_type = parse_type(buf.get_u32())?;
        let body = Bytes::copy_from_slice(&buf[..size - TYPE_LEN]);
        Ok(Frame { frame_type, body })
    }

    /// Кодирует кадр в формат, который отправляет nsqd. Нужен тестовым
    /// серверам и отладочному выводу.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.body.len());
        out.put_u32((self.body.len() + TYPE_LEN) as u32);
        out.put_u32(self.frame_type.into());
        out.put_slice(&self.body);
        out.freeze()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Response && self.body.as_ref() == HEARTBEAT
    }

    pub fn is_close_wait(&self) -> bool {
        self.frame_type == FrameType::Response && self.body.as_ref() == CLOSE_WAIT
    }

    pub fn is_ok(&self) -> bool {
        self.frame_type == FrameType::Response && self.body.as_ref() == OK
    }
}

fn parse_type(raw: u32) -> NsqResult<FrameType> {
    FrameType::try_from(raw)
        .map_err(|_| NsqError::protocol(format!("unknown frame type {raw}")).into())
}

/// Читает из сокета ровно один кадр.
///
/// Кадры размером больше `limit` отклоняются до чтения тела.
pub async fn read_frame<R>(
    reader: &mut R,
    limit: usize,
) -> NsqResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await? as usize;
    if size < TYPE_LEN {
        return Err(NsqError::protocol(format!("bad frame size {size}")).into());
    }
    if size > limit {
        return Err(NsqError::FrameTooLarge { size, limit }.into());
    }
    let frame_type = parse_type(reader.read_u32().await?)?;
    let mut body = vec![0u8; size - TYPE_LEN];
    reader.read_exact(&mut body).await?;
    Ok(Frame {
        frame_type,
        body: Bytes::from(body),
    })
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
