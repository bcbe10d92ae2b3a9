pub mod consumer;
pub mod handler;
pub mod lookup;
pub mod lookupd;
pub mod producer;
pub mod registry;

// Публичный экспорт основных типов клиента, чтобы внешний код не
// зависел от раскладки модулей.
pub use consumer::{per_conn_max_in_flight, Consumer, ConsumerStats};
pub use handler::{FnHandler, MsgHandler};
pub use lookup::{Lookup, LookupStats};
pub use lookupd::{
    normalize_address, parse_lookup_response, Access, HttpLookupdClient, LookupData, LookupMeta,
    LookupdClient, NsqdNode,
};
pub use producer::Producer;
pub use registry::NsqClient;
