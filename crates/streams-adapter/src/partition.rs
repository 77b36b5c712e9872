//! Deterministic channel to stream assignment.

use crate::config::StreamsConfig;

/// 32-bit string hash over UTF-16 code units: `h = h * 31 + c`, wrapping.
///
/// Nodes written in other languages compute the same value, so every node
/// maps a channel to the same partition.
pub fn hash_code(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

/// Partition of `channel` among `count` streams. Never negative.
pub fn partition_index(channel: &str, count: usize) -> usize {
    if count <= 1 {
        return 0;
    }
    hash_code(channel).rem_euclid(count as i32) as usize
}

/// Stream that carries the durable messages of `channel`.
pub fn stream_name(config: &StreamsConfig, channel: &str) -> String {
    if config.stream_count <= 1 {
        config.stream_name.clone()
    } else {
        format!(
            "{}-{}",
            config.stream_name,
            partition_index(channel, config.stream_count)
        )
    }
}

/// Every stream of the cluster, in partition order.
pub fn stream_names(config: &StreamsConfig) -> Vec<String> {
    if config.stream_count <= 1 {
        vec![config.stream_name.clone()]
    } else {
        (0..config.stream_count)
            .map(|i| format!("{}-{}", config.stream_name, i))
            .collect()
    }
}
