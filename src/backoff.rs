//! Экспоненциальный backoff с разбросом.
//!
//! `delay(n) = base(n) * (1 + jitter * r * (factor - 1))`, где
//! `base(n) = min * factor^(n-1)`, `r` равномерно распределено в `[0, 1)`,
//! а результат ограничен сверху `max`. Разброс не выходит за пределы
//! `[base(n), base(n+1))`, поэтому задержка не убывает с ростом `n` при
//! любом `factor >= 1`, а повторные вызовы с одним `n` дают разные значения.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Задержка для попытки `attempt` (нумерация с 1). Для `0` возвращает ноль.
pub fn calculate(
    attempt: u32,
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
) -> Duration {
    calculate_with_rng(&mut rand::thread_rng(), attempt, min, max, factor, jitter)
}

/// То же, что [`calculate`], но с явным источником случайности.
pub fn calculate_with_rng<R: Rng>(
    rng: &mut R,
    attempt: u32,
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
) -> Duration {
    if attempt == 0 || max.is_zero() {
        return Duration::ZERO;
    }

    let factor = factor.max(1.0);
    let jitter = jitter.clamp(0.0, 1.0);
    let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let base = min.as_secs_f64() * factor.powi(exp);
    let max_secs = max.as_secs_f64();
    if !base.is_finite() || base >= max_secs {
        return max;
    }

    let r: f64 = rng.gen_range(0.0..1.0);
    let delay = base * (1.0 + jitter * r * (factor - 1.0));
    Duration::from_secs_f64(delay).min(max)
}

/// Задержка по настройкам `message_backoff`.
pub fn from_config(
    attempt: u32,
    cfg: &BackoffConfig,
) -> Duration {
    calculate(
        attempt,
        cfg.min_delay(),
        cfg.max_delay(),
        cfg.factor,
        cfg.jitter,
    )
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
