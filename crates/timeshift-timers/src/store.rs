//! Binary persistence for the timer set.
//!
//! File layout: a version byte `0x01`, a little-endian `u32` record count,
//! then one fixed-width record per timer:
//!
//! ```text
//! channel_id       u32 LE
//! start_epoch      i64 LE
//! end_epoch        i64 LE
//! margin_start_min u16 LE
//! margin_end_min   u16 LE
//! state            u8
//! title            u8 length prefix + UTF-8 bytes (<= 255)
//! client_index     u32 LE
//! ```

use std::fs;
use std::io;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::{Timer, TimerError, TimerState};

const FORMAT_VERSION: u8 = 0x01;
const FIXED_HEAD_LEN: usize = 4 + 8 + 8 + 2 + 2 + 1 + 1;

/// Serialize the timer set to `path`, creating parent directories.
pub fn save<'a>(path: &Path, timers: impl Iterator<Item = &'a Timer>) -> io::Result<()> {
    let timers: Vec<&Timer> = timers.collect();
    let mut buf = BytesMut::with_capacity(8 + timers.len() * 64);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u32_le(timers.len() as u32);
    for timer in timers {
        buf.put_u32_le(timer.channel_id);
        buf.put_i64_le(timer.start);
        buf.put_i64_le(timer.end);
        buf.put_u16_le(timer.margin_start_min);
        buf.put_u16_le(timer.margin_end_min);
        buf.put_u8(timer.state.as_u8());
        let title = truncate_utf8(&timer.title, 255);
        buf.put_u8(title.len() as u8);
        buf.put_slice(title.as_bytes());
        buf.put_u32_le(timer.client_index);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, &buf)
}

/// Deserialize a timer set from `path`.
pub fn load(path: &Path) -> Result<Vec<Timer>, TimerError> {
    let data = fs::read(path)?;
    let mut buf = &data[..];

    need(&buf, 1 + 4)?;
    let version = buf.get_u8();
    if version != FORMAT_VERSION {
        return Err(TimerError::Corrupt(format!(
            "unsupported version {version:#04x}"
        )));
    }
    let count = buf.get_u32_le() as usize;

    let mut timers = Vec::with_capacity(count);
    for _ in 0..count {
        need(&buf, FIXED_HEAD_LEN)?;
        let channel_id = buf.get_u32_le();
        let start = buf.get_i64_le();
        let end = buf.get_i64_le();
        let margin_start_min = buf.get_u16_le();
        let margin_end_min = buf.get_u16_le();
        let state = TimerState::from_u8(buf.get_u8())
            .ok_or_else(|| TimerError::Corrupt("unknown timer state".to_string()))?;
        let title_len = buf.get_u8() as usize;

        need(&buf, title_len + 4)?;
        let title_bytes = buf.copy_to_bytes(title_len);
        let title = String::from_utf8(title_bytes.to_vec())
            .map_err(|_| TimerError::Corrupt("title is not UTF-8".to_string()))?;
        let client_index = buf.get_u32_le();

        timers.push(Timer {
            channel_id,
            start,
            end,
            margin_start_min,
            margin_end_min,
            state,
            title,
            client_index,
        });
    }
    Ok(timers)
}

fn need(buf: &&[u8], len: usize) -> Result<(), TimerError> {
    if buf.remaining() < len {
        Err(TimerError::Corrupt("record truncated".to_string()))
    } else {
        Ok(())
    }
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 character.
fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Timer> {
        vec![
            Timer {
                channel_id: 7,
                start: 1_700_000_000,
                end: 1_700_003_600,
                margin_start_min: 2,
                margin_end_min: 5,
                state: TimerState::Scheduled,
                title: "Evening news".to_string(),
                client_index: 1,
            },
            Timer {
                channel_id: 9,
                start: 1_700_010_000,
                end: 1_700_013_600,
                margin_start_min: 0,
                margin_end_min: 0,
                state: TimerState::Recording,
                title: "Фильм".to_string(),
                client_index: 2,
            },
        ]
    }

    #[test]
    fn round_trips_a_timer_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timers.dat");
        let timers = sample();
        save(&path, timers.iter()).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, timers);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache").join("timers.dat");
        save(&path, sample().iter()).unwrap();
        assert_eq!(load(&path).unwrap().len(), 2);
    }

    #[test]
    fn long_titles_are_truncated_at_a_char_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timers.dat");
        let mut timer = sample().remove(0);
        // Multi-byte characters force a boundary-aware cut.
        timer.title = "ы".repeat(200);
        save(&path, std::iter::once(&timer)).unwrap();
        let loaded = load(&path).unwrap();
        assert!(loaded[0].title.len() <= 255);
        assert!(loaded[0].title.chars().all(|c| c == 'ы'));
    }

    #[test]
    fn rejects_unknown_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timers.dat");
        std::fs::write(&path, [0x02, 0, 0, 0, 0]).unwrap();
        assert!(matches!(load(&path), Err(TimerError::Corrupt(_))));
    }

    #[test]
    fn rejects_truncated_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timers.dat");
        save(&path, sample().iter()).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 3);
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(load(&path), Err(TimerError::Corrupt(_))));
    }

    #[test]
    fn empty_set_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timers.dat");
        save(&path, std::iter::empty::<&Timer>()).unwrap();
        assert!(load(&path).unwrap().is_empty());
    }
}
