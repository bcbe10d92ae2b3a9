//! Сетевой модуль nsqlink.
//!
//! Включает кодек протокола NSQ V2 и соединение с nsqd.
//!
//! ## Подмодули
//!
//! - `nsq`: фрейминг, разбор сообщений и кодирование команд.
//! - `connection`: протокольный автомат одного соединения с nsqd.
//! - `connection_state`: состояния соединения и счётчики кредита.
//! - `delegate`: интерфейсы обратных вызовов соединения.

pub mod connection;
pub mod connection_state;
pub mod delegate;
pub mod nsq;

pub use connection::{ConnId, Connection};
pub use connection_state::{ConnectionSnapshot, ConnectionState};
pub use delegate::{ConnDelegate, MsgDelegate, NsqdDelegate};
pub use nsq::*;
