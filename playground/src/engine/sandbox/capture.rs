//! Bounded capture of a stage's stdout/stderr

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Collects both streams plus their interleaving in arrival order. Each
/// stream keeps at most `limit` bytes; anything past that is dropped and the
/// capture is marked truncated.
#[derive(Debug)]
pub struct OutputCapture {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    output: Vec<u8>,
    overflowed: Option<Stream>,
}

/// Captured text, lossily decoded
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    pub truncated: bool,
    /// e.g. `stdout length exceeded`
    pub message: Option<String>,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            output: Vec::new(),
            overflowed: None,
        }
    }

    /// Append a chunk. Returns `false` once the stream went over its limit.
    pub fn push(&mut self, stream: Stream, chunk: &[u8]) -> bool {
        let buf = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        let room = self.limit.saturating_sub(buf.len());
        let take = room.min(chunk.len());
        buf.extend_from_slice(&chunk[..take]);
        self.output.extend_from_slice(&chunk[..take]);

        if take < chunk.len() {
            self.overflowed.get_or_insert(stream);
            false
        } else {
            true
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.overflowed.is_some()
    }

    pub fn finish(self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            output: String::from_utf8_lossy(&self.output).into_owned(),
            truncated: self.overflowed.is_some(),
            message: self
                .overflowed
                .map(|s| format!("{} length exceeded", s.as_str())),
        }
    }
}
