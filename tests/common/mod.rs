//! Тестовые двойники: nsqd на `127.0.0.1:0` и статический lookupd.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use nsqlink::{
    network::nsq::frame::{CLOSE_WAIT, OK},
    Access, Frame, FrameType, LookupData, LookupdClient, NsqConfig, NsqResult, NsqdNode,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

/// Команды, после строки которых идёт тело с префиксом длины.
const SIZED: &[&str] = &["IDENTIFY", "AUTH", "PUB", "MPUB", "PUB_EXT"];

/// Команда, полученная от клиента.
#[derive(Debug, Clone)]
pub struct Received {
    pub line: String,
    pub body: Bytes,
}

/// Минимальный nsqd: отвечает `OK` на `IDENTIFY`, `SUB` и публикации,
/// на `CLS` отвечает `CLOSE_WAIT`. Остальные кадры тест отправляет сам.
pub struct FakeNsqd {
    pub port: u16,
    commands: mpsc::UnboundedReceiver<Received>,
    writer: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    reject_publish: Arc<AtomicUsize>,
    pub connections: Arc<AtomicUsize>,
}

impl FakeNsqd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, commands) = mpsc::unbounded_channel();
        let writer = Arc::new(Mutex::new(None));
        let reject_publish = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));

        let (w, r, c) = (writer.clone(), reject_publish.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                c.fetch_add(1, Ordering::SeqCst);
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                *w.lock() = Some(out_tx.clone());
                tokio::spawn(serve(sock, tx.clone(), out_tx, out_rx, r.clone()));
            }
        });

        Self {
            port,
            commands,
            writer,
            reject_publish,
            connections,
        }
    }

    /// Следующая команда, начинающаяся с `prefix`. Прочие пропускаются.
    pub async fn expect(
        &mut self,
        prefix: &str,
    ) -> Received {
        let wait = async {
            loop {
                let cmd = self.commands.recv().await.expect("fake nsqd stopped");
                if cmd.line.starts_with(prefix) {
                    return cmd;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("no {prefix} command within 5s"))
    }

    /// Отправляет кадр в последнее принятое соединение.
    pub fn send(
        &self,
        frame: Frame,
    ) {
        let writer = self.writer.lock();
        writer
            .as_ref()
            .expect("no client connected")
            .send(frame.encode())
            .unwrap();
    }

    /// Следующие `n` публикаций получат `E_BAD_TOPIC`.
    pub fn reject_publishes(
        &self,
        n: usize,
    ) {
        self.reject_publish.store(n, Ordering::SeqCst);
    }
}

async fn serve(
    sock: TcpStream,
    commands: mpsc::UnboundedSender<Received>,
    out_tx: mpsc::UnboundedSender<Bytes>,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    reject_publish: Arc<AtomicUsize>,
) {
    let (read_half, mut write_half) = sock.into_split();
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut magic = [0u8; 4];
    if reader.read_exact(&mut magic).await.is_err() || &magic != b"  V2" {
        return;
    }

    let reply = |frame_type: FrameType, body: &'static [u8]| {
        let _ = out_tx.send(Frame::new(frame_type, body).encode());
    };

    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        line.pop();
        let line = String::from_utf8_lossy(&line).into_owned();
        let name = line.split(' ').next().unwrap_or_default().to_string();

        let mut body = Vec::new();
        if SIZED.contains(&name.as_str()) {
            let Ok(size) = reader.read_u32().await else {
                return;
            };
            body.resize(size as usize, 0);
            if reader.read_exact(&mut body).await.is_err() {
                return;
            }
        }
        let _ = commands.send(Received {
            line,
            body: body.into(),
        });

        match name.as_str() {
            "IDENTIFY" | "SUB" => reply(FrameType::Response, OK),
            "PUB" | "MPUB" | "PUB_EXT" => {
                let rejected = reject_publish
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if rejected {
                    reply(FrameType::Error, b"E_BAD_TOPIC PUB topic is not served here");
                } else {
                    reply(FrameType::Response, OK);
                }
            }
            "CLS" => reply(FrameType::Response, CLOSE_WAIT),
            _ => {}
        }
    }
}

/// lookupd, который всегда отвечает одним и тем же узлом.
pub struct StaticLookupd {
    port: u16,
    pub queries: AtomicUsize,
}

impl StaticLookupd {
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            queries: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LookupdClient for StaticLookupd {
    async fn lookup(
        &self,
        _addr: &str,
        _topic: &str,
        _access: Access,
    ) -> NsqResult<LookupData> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(LookupData {
            producers: vec![NsqdNode {
                broadcast_address: "127.0.0.1".to_string(),
                tcp_port: self.port,
                http_port: None,
                hostname: None,
                remote_address: None,
                version: None,
            }],
            ..Default::default()
        })
    }
}

pub fn config() -> NsqConfig {
    NsqConfig {
        lookupd_addrs: vec!["http://127.0.0.1:4161".to_string()],
        publish_retry: 1,
        ..NsqConfig::default()
    }
}
