//! Кодек протокола NSQ (TCP, версия V2).
//!
//! ## Подмодули
//!
//! - `names`: проверка имён топиков и каналов.
//! - `frame`: кадры `[size][type][body]`, чтение кадров из сокета.
//! - `message`: разбор тела `FrameTypeMessage` и ответы на сообщение.
//! - `command`: кодирование команд клиента (`IDENTIFY`, `SUB`, `PUB`, ...).
//! - `params`: параметры расширения для `PUB_EXT`.

pub mod command;
pub mod frame;
pub mod message;
pub mod names;
pub mod params;

pub use command::{Command, IdentifyResponse};
pub use frame::{read_frame, Frame, FrameType, CLOSE_WAIT, HEARTBEAT, OK};
pub use message::{Message, MessageId, RequeueDelay};
pub use names::{is_valid_name, validate_name};
pub use params::MessageParams;

/// Магическая последовательность рукопожатия протокола V2.
pub const MAGIC_V2: &[u8; 4] = b"  V2";
