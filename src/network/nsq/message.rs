use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nsqlink_error::{NsqError, NsqResult};

use crate::network::delegate::MsgDelegate;

/// Минимальный размер тела сообщения: timestamp + attempts + id.
pub const MESSAGE_HEADER_LEN: usize = 8 + 2 + 16;
/// Версия расширения, в котором передаётся тег сообщения.
const EXT_VERSION_TAG: u8 = 2;

/// 16-байтовый идентификатор сообщения (hex в ASCII на стороне nsqd).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn new(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    /// Дополняет короткий идентификатор нулями справа.
    pub fn from_slice(raw: &[u8]) -> Self {
        let mut id = [0u8; 16];
        let n = raw.len().min(16);
        id[..n].copy_from_slice(&raw[..n]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// Задержка перед повторной доставкой сообщения.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDelay {
    /// Вычисляется по числу попыток и настройкам `message_backoff`.
    Auto,
    After(Duration),
}

/// Сообщение, полученное от nsqd.
///
/// После декодирования неизменяемо, кроме флага ответа: `responded`
/// переходит из `false` в `true` ровно один раз (FIN или REQ) и обратно не
/// возвращается.
pub struct Message {
    id: MessageId,
    timestamp: i64,
    attempts: u16,
    body: Bytes,
    tag: Option<String>,
    partition: Option<u32>,
    responded: AtomicBool,
    auto_response: AtomicBool,
    delegate: Option<Weak<dyn MsgDelegate>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Message {
    /// Создаёт сообщение вручную. Используется тестами и инструментами.
    pub fn new(
        id: MessageId,
        attempts: u16,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            id,
            timestamp: 0,
            attempts,
            body: body.into(),
            tag: None,
            partition: None,
            responded: AtomicBool::new(false),
            auto_response: AtomicBool::new(true),
            delegate: None,
        }
    }

    /// Разбирает тело кадра `FrameTypeMessage`.
    ///
    /// # Параметры
    /// - `body`: тело кадра без заголовка `[size][type]`.
    /// - `extended`: соединение договорилось о расширенном формате (после
    ///   id идёт байт версии и, при версии > 0, блок расширения).
    ///
    /// # Возвращает
    /// `ProtocolError`, если тело короче 26 байт или блок расширения обрезан.
    pub fn decode(
        body: Bytes,
        extended: bool,
    ) -> NsqResult<Message> {
        if body.len() < MESSAGE_HEADER_LEN {
            return Err(NsqError::protocol(format!(
                "not enough data to decode message: {} bytes",
                body.len()
            ))
            .into());
        }

        let mut buf = body;
        let timestamp = buf.get_i64();
        let attempts = buf.get_u16();
        let id = MessageId::from_slice(&buf.split_to(16));

        let mut tag = None;
        if extended {
            if !buf.has_remaining() {
                return Err(NsqError::protocol("missing extension version").into());
            }
            let version = buf.get_u8();
            if version > 0 {
                if buf.remaining() < 2 {
                    return Err(NsqError::protocol("missing extension length").into());
                }
                let ext_len = buf.get_u16() as usize;
                if buf.remaining() < ext_len {
                    return Err(NsqError::protocol(format!(
                        "extension of {ext_len} bytes is truncated"
                    ))
                    .into());
                }
                let ext = buf.split_to(ext_len);
                if version == EXT_VERSION_TAG {
                    tag = Some(String::from_utf8_lossy(&ext).into_owned());
                }
            }
        }

        Ok(Message {
            id,
            timestamp,
            attempts,
            body: buf,
            tag,
            partition: None,
            responded: AtomicBool::new(false),
            auto_response: AtomicBool::new(true),
            delegate: None,
        })
    }

    /// Кодирует сообщение так, как его отправляет nsqd.
    pub fn encode(
        &self,
        extended: bool,
    ) -> Bytes {
        let mut out = BytesMut::with_capacity(MESSAGE_HEADER_LEN + 3 + self.body.len());
        out.put_i64(self.timestamp);
        out.put_u16(self.attempts);
        out.put_slice(self.id.as_bytes());
        if extended {
            match &self.tag {
                Some(tag) => {
                    out.put_u8(EXT_VERSION_TAG);
                    out.put_u16(tag.len() as u16);
                    out.put_slice(tag.as_bytes());
                }
                None => out.put_u8(0),
            }
        }
        out.put_slice(&self.body);
        out.freeze()
    }

    pub fn with_timestamp(
        mut self,
        timestamp: i64,
    ) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(
        mut self,
        tag: impl Into<String>,
    ) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Привязывает сообщение к соединению, которое отправит FIN/REQ/TOUCH.
    pub(crate) fn attach(
        mut self,
        delegate: Weak<dyn MsgDelegate>,
        partition: Option<u32>,
        auto_response: bool,
    ) -> Self {
        self.delegate = Some(delegate);
        self.partition = partition;
        self.auto_response = AtomicBool::new(auto_response);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    /// Отключает автоматический FIN/REQ после возврата из обработчика.
    pub fn disable_auto_response(&self) {
        self.auto_response.store(false, Ordering::Release);
    }

    pub fn is_auto_response(&self) -> bool {
        self.auto_response.load(Ordering::Acquire)
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Отправляет `FIN`. Возвращает `false`, если ответ уже был отправлен.
    pub fn finish(&self) -> bool {
        if self.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_finish(self);
        }
        true
    }

    /// Отправляет `REQ`.
    ///
    /// # Параметры
    /// - `delay`: задержка повторной доставки.
    /// - `backoff`: поднять сигнал backoff у потребителя.
    ///
    /// # Возвращает
    /// `false`, если ответ уже был отправлен.
    pub fn requeue(
        &self,
        delay: RequeueDelay,
        backoff: bool,
    ) -> bool {
        if self.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_requeue(self, delay, backoff);
        }
        true
    }

    /// Продлевает таймаут сообщения на nsqd. После ответа ничего не делает.
    pub fn touch(&self) {
        if self.has_responded() {
            return;
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_touch(self);
        }
    }

    fn delegate(&self) -> Option<Arc<dyn MsgDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Message {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("attempts", &self.attempts)
            .field("body_len", &self.body.len())
            .field("tag", &self.tag)
            .field("responded", &self.has_responded())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
