use std::any::type_name;
use std::time::Duration;

use anyhow::Context;
use bincode::{Decode, Encode};
use bytes::BytesMut;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

pub fn read_u32(src: &BytesMut, offset: usize) -> u32 {
    let mut u32_bytes = [0u8; 4];
    u32_bytes.copy_from_slice(&src[offset..(offset + 4)]);
    u32::from_be_bytes(u32_bytes)
}

pub fn encode_bytes<T>(value: &T) -> anyhow::Result<Vec<u8>>
where
    T: Encode,
{
    bincode::encode_to_vec(value, bincode::config::standard()).context(type_name::<T>())
}

pub fn decode_bytes<T>(bytes: &[u8]) -> anyhow::Result<T>
where
    T: Decode<()>,
{
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .context(type_name::<T>())
        .map(|(t, _)| t)
}

pub fn init_logger(level: tracing::Level) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty();
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_max_level(level)
        .try_init();
}

pub fn init_logger_with_filter(filter: impl Into<EnvFilter>) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty()
        .with_file(false);
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .try_init();
}

/// Capped exponential backoff: `base * multiplier^attempt`, never above `max`.
pub fn capped_backoff(base: Duration, multiplier: f64, attempt: u32, max: Duration) -> Duration {
    let factor = multiplier.max(1.0).powi(attempt.min(64) as i32);
    let millis = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bincode::{Decode, Encode};
    use bytes::{BufMut, BytesMut};

    use crate::ext::{capped_backoff, decode_bytes, encode_bytes, read_u32};

    #[derive(Debug, Eq, PartialEq, Encode, Decode)]
    struct Sample {
        name: String,
        value: Option<Vec<u8>>,
    }

    #[test]
    fn test_bincode_helpers() -> anyhow::Result<()> {
        let sample = Sample {
            name: "map".to_string(),
            value: Some(vec![1, 2, 3]),
        };
        let bytes = encode_bytes(&sample)?;
        let decoded: Sample = decode_bytes(&bytes)?;
        assert_eq!(decoded, sample);
        assert!(decode_bytes::<Sample>(&[0xff]).is_err());
        Ok(())
    }

    #[test]
    fn test_read_u32() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u32(0x01020304);
        assert_eq!(read_u32(&buf, 1), 0x01020304);
    }

    #[test]
    fn test_capped_backoff() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(capped_backoff(base, 2.0, 0, max), Duration::from_millis(100));
        assert_eq!(capped_backoff(base, 2.0, 3, max), Duration::from_millis(800));
        assert_eq!(capped_backoff(base, 2.0, 4, max), max);
        assert_eq!(capped_backoff(base, 2.0, u32::MAX, max), max);
    }
}
