use std::cmp::min;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;

use crate::error::{PulsedError, Result};

/// Utility for timing consecutive phases of a long operation.
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since construction or the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        tracing::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Marches over `0..end_pos` in steps of at most `interval`.
pub struct ChunkCounter {
    pos: usize,
    end_pos: usize,
    interval: usize,
}

impl ChunkCounter {
    pub fn new(end_pos: usize, interval: usize) -> Self {
        Self {
            pos: 0,
            end_pos,
            interval: interval.max(1),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_done(&self) -> bool {
        self.pos == self.end_pos
    }

    /// Next `(start, end)` interval, empty once the end is reached.
    pub fn tick_next(&mut self) -> (usize, usize) {
        let start = self.pos;
        self.pos = min(self.pos + self.interval, self.end_pos);
        (start, self.pos)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Analog,
    Digital,
}

fn channel_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(a|d)_ch(\d+)$").unwrap())
}

/// Parses names of the form `a_ch<N>` / `d_ch<N>` into kind and channel number.
pub fn parse_channel(name: &str) -> Result<(ChannelKind, usize)> {
    let caps = channel_regex().captures(name).ok_or_else(|| {
        PulsedError::config(format!(
            "Channel name {} does not match a_ch<N> or d_ch<N>",
            name
        ))
    })?;
    let kind = match &caps[1] {
        "a" => ChannelKind::Analog,
        _ => ChannelKind::Digital,
    };
    let number = caps[2]
        .parse::<usize>()
        .map_err(|e| PulsedError::config(format!("Channel name {}: {}", name, e)))?;
    Ok((kind, number))
}

pub fn is_analog_channel(name: &str) -> bool {
    matches!(parse_channel(name), Ok((ChannelKind::Analog, _)))
}

pub fn is_digital_channel(name: &str) -> bool {
    matches!(parse_channel(name), Ok((ChannelKind::Digital, _)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_counter() {
        let mut counter = ChunkCounter::new(10, 4);
        assert_eq!(counter.tick_next(), (0, 4));
        assert_eq!(counter.tick_next(), (4, 8));
        assert!(!counter.is_done());
        assert_eq!(counter.tick_next(), (8, 10));
        assert!(counter.is_done());
        assert_eq!(counter.tick_next(), (10, 10));
    }

    #[test]
    fn channel_names() {
        assert_eq!(parse_channel("a_ch2").unwrap(), (ChannelKind::Analog, 2));
        assert_eq!(parse_channel("d_ch14").unwrap(), (ChannelKind::Digital, 14));
        assert!(parse_channel("ao0").is_err());
        assert!(parse_channel("d_ch").is_err());
        assert!(is_analog_channel("a_ch1"));
        assert!(!is_digital_channel("a_ch1"));
    }
}
