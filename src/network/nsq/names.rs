use nsqlink_error::{NsqError, NsqResult};

pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 64;

/// Проверяет имя топика или канала на соответствие
/// `^[.a-zA-Z0-9_-]{2,64}$`.
pub fn is_valid_name(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// То же, что [`is_valid_name`], но возвращает [`NsqError::InvalidName`].
pub fn validate_name(name: &str) -> NsqResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(NsqError::InvalidName {
            name: name.to_string(),
        }
        .into())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
