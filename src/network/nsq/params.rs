use std::collections::BTreeMap;

use nsqlink_error::{NsqError, NsqResult};
use serde::{Deserialize, Serialize};

pub const TAG_KEY: &str = "##client_dispatch_tag";
pub const TRACE_ID_KEY: &str = "##trace_id";
/// Префикс зарезервированных ключей расширения.
const RESERVED_PREFIX: &str = "##";

/// Заголовки расширения, которые `PUB_EXT` передаёт перед телом сообщения.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageParams {
    params: BTreeMap<String, String>,
}

impl MessageParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Тег диспетчеризации, по которому nsqd направляет сообщение.
    pub fn with_tag(
        mut self,
        tag: impl Into<String>,
    ) -> Self {
        self.params.insert(TAG_KEY.to_string(), tag.into());
        self
    }

    pub fn with_trace_id(
        mut self,
        trace_id: impl Into<String>,
    ) -> Self {
        self.params.insert(TRACE_ID_KEY.to_string(), trace_id.into());
        self
    }

    /// Добавляет пользовательский заголовок. Имена, начинающиеся с `##`,
    /// зарезервированы.
    pub fn with_custom(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> NsqResult<Self> {
        let name = name.into();
        if name.starts_with(RESERVED_PREFIX) {
            return Err(NsqError::InvalidMessageParam { name }.into());
        }
        self.params.insert(name, value.into());
        Ok(self)
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get(TAG_KEY).map(String::as_str)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.params.get(TRACE_ID_KEY).map(String::as_str)
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// JSON-представление заголовков (ключи в лексикографическом порядке).
    pub fn to_json(&self) -> NsqResult<Vec<u8>> {
        serde_json::to_vec(&self.params).map_err(|e| {
            NsqError::Protocol {
                reason: format!("encode message params: {e}"),
            }
            .into()
        })
    }
}
