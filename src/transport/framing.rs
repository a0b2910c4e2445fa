use log::warn;

pub const MAX_LINE_LEN: usize = 128;

/// Splits a byte stream into `\n` terminated lines. A line that grows past
/// [`MAX_LINE_LEN`] is cut and dispatched as it is.
#[derive(Debug, Default)]
pub struct LineDeframer {
    buf: Vec<u8>,
}

impl LineDeframer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_LINE_LEN),
        }
    }

    pub fn push(&mut self, bytes: &[u8], mut on_line: impl FnMut(String)) {
        for &b in bytes {
            match b {
                b'\n' => {
                    if !self.buf.is_empty() {
                        on_line(self.take());
                    }
                }
                b'\r' => {}
                _ => {
                    self.buf.push(b);
                    if self.buf.len() >= MAX_LINE_LEN {
                        warn!("transport: line over {} bytes, cut", MAX_LINE_LEN);
                        on_line(self.take());
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}
