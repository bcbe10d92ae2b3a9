use std::{fmt, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use nsqlink_error::{NsqError, NsqResult};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{message::MessageId, names::validate_name, params::MessageParams};

/// Команда клиента.
///
/// Варианты открыты для прямого построения (тестовые серверы, отладка),
/// а конструкторы ниже проверяют имена топиков и каналов до любого I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Bytes),
    Auth(Bytes),
    Sub {
        topic: String,
        channel: String,
    },
    Pub {
        topic: String,
        partition: Option<u32>,
        body: Bytes,
    },
    PubExt {
        topic: String,
        partition: Option<u32>,
        ext: Bytes,
        body: Bytes,
    },
    Mpub {
        topic: String,
        bodies: Vec<Bytes>,
    },
    Rdy(u64),
    Fin(MessageId),
    Req {
        id: MessageId,
        delay: Duration,
    },
    Touch(MessageId),
    Cls,
    Nop,
}

/// Ответ nsqd на `IDENTIFY` при включённом `feature_negotiation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: Option<u64>,
    pub version: Option<String>,
    pub max_msg_timeout: Option<u64>,
    pub msg_timeout: Option<u64>,
    pub tls_v1: bool,
    pub deflate: bool,
    pub snappy: bool,
    pub auth_required: bool,
    pub sample_rate: Option<i64>,
    pub output_buffer_size: Option<i64>,
    pub output_buffer_timeout: Option<i64>,
}

////////////////////////////////////////////////////////////////////////////////
// Конструкторы
////////////////////////////////////////////////////////////////////////////////

impl Command {
    /// `IDENTIFY` с JSON-телом. Слэши в JSON не экранируются.
    pub fn identify(params: &Map<String, Value>) -> NsqResult<Command> {
        let json = serde_json::to_vec(params)
            .map_err(|e| NsqError::protocol(format!("encode identify: {e}")))?;
        Ok(Command::Identify(Bytes::from(json)))
    }

    pub fn auth(secret: impl Into<Bytes>) -> Command {
        Command::Auth(secret.into())
    }

    pub fn sub(
        topic: &str,
        channel: &str,
    ) -> NsqResult<Command> {
        validate_name(topic)?;
        validate_name(channel)?;
        Ok(Command::Sub {
            topic: topic.to_string(),
            channel: channel.to_string(),
        })
    }

    pub fn publish(
        topic: &str,
        body: impl Into<Bytes>,
        partition: Option<u32>,
    ) -> NsqResult<Command> {
        validate_name(topic)?;
        Ok(Command::Pub {
            topic: topic.to_string(),
            partition,
            body: body.into(),
        })
    }

    /// `PUB_EXT`: тело предваряется `[2 байта длины][JSON заголовков]`.
    pub fn publish_ext(
        topic: &str,
        body: impl Into<Bytes>,
        partition: Option<u32>,
        params: &MessageParams,
    ) -> NsqResult<Command> {
        validate_name(topic)?;
        let ext = params.to_json()?;
        if ext.len() > u16::MAX as usize {
            return Err(NsqError::InvalidMessageParam {
                name: format!("<{} bytes of headers>", ext.len()),
            }
            .into());
        }
        Ok(Command::PubExt {
            topic: topic.to_string(),
            partition,
            ext: Bytes::from(ext),
            body: body.into(),
        })
    }

    pub fn multi_publish(
        topic: &str,
        bodies: Vec<Bytes>,
    ) -> NsqResult<Command> {
        validate_name(topic)?;
        if bodies.is_empty() {
            return Err(NsqError::EmptyMessages.into());
        }
        Ok(Command::Mpub {
            topic: topic.to_string(),
            bodies,
        })
    }

    pub fn rdy(count: u64) -> Command {
        Command::Rdy(count)
    }

    pub fn fin(id: MessageId) -> Command {
        Command::Fin(id)
    }

    pub fn req(
        id: MessageId,
        delay: Duration,
    ) -> Command {
        Command::Req { id, delay }
    }

    pub fn touch(id: MessageId) -> Command {
        Command::Touch(id)
    }

    pub fn cls() -> Command {
        Command::Cls
    }

    pub fn nop() -> Command {
        Command::Nop
    }
}

////////////////////////////////////////////////////////////////////////////////
// Кодирование
////////////////////////////////////////////////////////////////////////////////

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Sub { .. } => "SUB",
            Command::Pub { .. } => "PUB",
            Command::PubExt { .. } => "PUB_EXT",
            Command::Mpub { .. } => "MPUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
        }
    }

    /// Сериализует команду в байты протокола: строка, `\n`, затем
    /// необязательное тело с 4-байтовым префиксом длины.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Command::Identify(json) => {
                out.put_slice(b"IDENTIFY\n");
                put_sized(&mut out, json);
            }
            Command::Auth(secret) => {
                out.put_slice(b"AUTH\n");
                put_sized(&mut out, secret);
            }
            Command::Sub { topic, channel } => {
                put_line(&mut out, format_args!("SUB {topic} {channel}"));
            }
            Command::Pub {
                topic,
                partition,
                body,
            } => {
                put_line(&mut out, format_args!("PUB {topic}{}", Partition(*partition)));
                put_sized(&mut out, body);
            }
            Command::PubExt {
                topic,
                partition,
                ext,
                body,
            } => {
                put_line(
                    &mut out,
                    format_args!("PUB_EXT {topic}{}", Partition(*partition)),
                );
                out.put_u32((2 + ext.len() + body.len()) as u32);
                out.put_u16(ext.len() as u16);
                out.put_slice(ext);
                out.put_slice(body);
            }
            Command::Mpub { topic, bodies } => {
                put_line(&mut out, format_args!("MPUB {topic}"));
                let total: usize = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                out.put_u32(total as u32);
                out.put_u32(bodies.len() as u32);
                for body in bodies {
                    put_sized(&mut out, body);
                }
            }
            Command::Rdy(count) => put_line(&mut out, format_args!("RDY {count}")),
            Command::Fin(id) => {
                out.put_slice(b"FIN ");
                out.put_slice(id.as_bytes());
                out.put_u8(b'\n');
            }
            Command::Req { id, delay } => {
                out.put_slice(b"REQ ");
                out.put_slice(id.as_bytes());
                put_line(&mut out, format_args!(" {}", delay.as_millis()));
            }
            Command::Touch(id) => {
                out.put_slice(b"TOUCH ");
                out.put_slice(id.as_bytes());
                out.put_u8(b'\n');
            }
            Command::Cls => out.put_slice(b"CLS\n"),
            Command::Nop => out.put_slice(b"NOP\n"),
        }
        out.freeze()
    }
}

impl fmt::Display for Command {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Command::Sub { topic, channel } => write!(f, "SUB {topic} {channel}"),
            Command::Pub { topic, body, .. } => write!(f, "PUB {topic} ({} bytes)", body.len()),
            Command::PubExt { topic, body, .. } => {
                write!(f, "PUB_EXT {topic} ({} bytes)", body.len())
            }
            Command::Mpub { topic, bodies } => {
                write!(f, "MPUB {topic} ({} messages)", bodies.len())
            }
            Command::Rdy(count) => write!(f, "RDY {count}"),
            Command::Fin(id) => write!(f, "FIN {id}"),
            Command::Req { id, delay } => write!(f, "REQ {id} {}", delay.as_millis()),
            Command::Touch(id) => write!(f, "TOUCH {id}"),
            other => f.write_str(other.name()),
        }
    }
}

struct Partition(Option<u32>);

impl fmt::Display for Partition {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.0 {
            Some(p) => write!(f, " {p}"),
            None => Ok(()),
        }
    }
}

fn put_line(
    out: &mut BytesMut,
    line: fmt::Arguments<'_>,
) {
    out.put_slice(line.to_string().as_bytes());
    out.put_u8(b'\n');
}

fn put_sized(
    out: &mut BytesMut,
    body: &[u8],
) {
    out.put_u32(body.len() as u32);
    out.put_slice(body);
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use nsqlink_error::StatusCode;
    use serde_json::json;

    use super::*;

    fn id() -> MessageId {
        MessageId::from_slice(b"0123456789abcdef")
    }

    /// Тест проверяет байтовый формат одиночной публикации.
    #[test]
    fn test_pub_wire_format() {
        let cmd = Command::Pub {
            topic: "t".to_string(),
            partition: None,
            body: Bytes::from_static(b"hello"),
        };
        let mut expected = b"PUB t\n".to_vec();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"hello");
        assert_eq!(cmd.encode().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_pub_with_partition() {
        let cmd = Command::publish("orders", &b"x"[..], Some(3)).unwrap();
        assert!(cmd.encode().starts_with(b"PUB orders 3\n"));
    }

    #[test]
    fn test_publish_validates_topic() {
        let err = Command::publish("t", &b"hello"[..], None).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidName);
        let err = Command::sub("orders", "bad channel").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidName);
    }

    #[test]
    fn test_mpub_wire_format() {
        let cmd = Command::multi_publish(
            "orders",
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")],
        )
        .unwrap();
        let mut expected = b"MPUB orders\n".to_vec();
        expected.extend_from_slice(&(4u32 + 4 + 2 + 4 + 3).to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"cde");
        assert_eq!(cmd.encode().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_mpub_rejects_empty_batch() {
        let err = Command::multi_publish("orders", Vec::new()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::EmptyMessages);
    }

    #[test]
    fn test_pub_ext_wire_format() {
        let params = MessageParams::new().with_tag("blue");
        let cmd = Command::publish_ext("orders", &b"hi"[..], None, &params).unwrap();
        let ext = br###"{"##client_dispatch_tag":"blue"}"###;

        let mut expected = b"PUB_EXT orders\n".to_vec();
        expected.extend_from_slice(&((2 + ext.len() + 2) as u32).to_be_bytes());
        expected.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        expected.extend_from_slice(ext);
        expected.extend_from_slice(b"hi");
        assert_eq!(cmd.encode().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_simple_lines() {
        assert_eq!(Command::rdy(25).encode().as_ref(), b"RDY 25\n");
        assert_eq!(Command::fin(id()).encode().as_ref(), b"FIN 0123456789abcdef\n");
        assert_eq!(
            Command::req(id(), Duration::from_millis(2500))
                .encode()
                .as_ref(),
            b"REQ 0123456789abcdef 2500\n"
        );
        assert_eq!(
            Command::touch(id()).encode().as_ref(),
            b"TOUCH 0123456789abcdef\n"
        );
        assert_eq!(Command::cls().encode().as_ref(), b"CLS\n");
        assert_eq!(Command::nop().encode().as_ref(), b"NOP\n");
        assert_eq!(
            Command::sub("orders", "billing").unwrap().encode().as_ref(),
            b"SUB orders billing\n"
        );
    }

    /// Тест проверяет, что JSON в `IDENTIFY` не экранирует слэши.
    #[test]
    fn test_identify_keeps_slashes() {
        let params = json!({ "user_agent": "nsqlink/0.1" });
        let cmd = Command::identify(params.as_object().unwrap()).unwrap();
        let encoded = cmd.encode();
        let body = br#"{"user_agent":"nsqlink/0.1"}"#;

        assert!(encoded.starts_with(b"IDENTIFY\n"));
        assert_eq!(&encoded[9..13], &(body.len() as u32).to_be_bytes());
        assert_eq!(&encoded[13..], body);
    }

    #[test]
    fn test_auth_is_length_prefixed() {
        let encoded = Command::auth(&b"s3cret"[..]).encode();
        assert_eq!(&encoded[..5], b"AUTH\n");
        assert_eq!(&encoded[5..9], &6u32.to_be_bytes());
        assert_eq!(&encoded[9..], b"s3cret");
    }

    #[test]
    fn test_identify_response_parses_partial_json() {
        let resp: IdentifyResponse =
            serde_json::from_str(r#"{"max_rdy_count":1000,"version":"1.2.0","unknown":1}"#)
                .unwrap();
        assert_eq!(resp.max_rdy_count, Some(1000));
        assert_eq!(resp.version.as_deref(), Some("1.2.0"));
        assert!(!resp.auth_required);
    }
}
