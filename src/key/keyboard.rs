use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};

use super::{KeyEdge, KeyEdgeQueue};
use crate::{clock::MonotonicClock, config::KeyConfig};

/// One timed action of the terminal key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keystroke {
    /// Hold the key for this long, then release
    Press(u64),
    /// Leave the key up for this long
    Pause(u64),
}

/// Turn a typed line into key actions. `.` and `-` are presses, a space
/// leaves enough silence to finish the letter, anything else is ignored.
pub fn keystrokes(line: &str, config: &KeyConfig, letter_gap_ms: u64) -> Vec<Keystroke> {
    let mut strokes = Vec::new();
    for c in line.chars() {
        match c {
            '.' => strokes.push(Keystroke::Press(config.dot_ms)),
            '-' => strokes.push(Keystroke::Press(config.dash_ms)),
            ' ' => {
                strokes.push(Keystroke::Pause(letter_gap_ms + config.gap_ms));
                continue;
            }
            _ => continue,
        }
        strokes.push(Keystroke::Pause(config.gap_ms));
    }
    strokes
}

/// Key the terminal's input into `queue` until stdin closes
pub fn spawn(
    queue: Arc<KeyEdgeQueue>,
    clock: MonotonicClock,
    config: KeyConfig,
    letter_gap_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("keyboard: type . and - then enter to key");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("keyboard: stdin closed");
                    break;
                }
                Err(e) => {
                    warn!("keyboard: failed to read stdin: {}", e);
                    break;
                }
            };

            let strokes = keystrokes(&line, &config, letter_gap_ms);
            debug!("keyboard: keying {:?}", line.trim());

            for stroke in strokes {
                match stroke {
                    Keystroke::Press(ms) => {
                        queue.push(KeyEdge::down(clock.now_us()));
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        queue.push(KeyEdge::up(clock.now_us()));
                    }
                    Keystroke::Pause(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystrokes() {
        let config = KeyConfig::default();
        let strokes = keystrokes(".- x", &config, 500);

        assert_eq!(
            strokes,
            vec![
                Keystroke::Press(80),
                Keystroke::Pause(120),
                Keystroke::Press(400),
                Keystroke::Pause(120),
                Keystroke::Pause(620),
            ]
        );
    }
}
